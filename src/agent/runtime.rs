//! The agent's cooperative main loop.
//!
//! Each iteration checks, in order: the reset button, then (when running) the
//! heartbeat, command poll and sensor timers. A device-level command carried
//! by the heartbeat runs right after it. Network failures are logged and
//! retried on the next due cycle; nothing is retried in a tight loop.

use std::time::Duration;
use tokio::time::Instant;

use super::board::Board;
use super::client::{DeviceApi, Identity};
use super::config::AgentConfig;
use super::error::AgentError;
use super::record::{DeviceRecord, WifiCredentials};
use super::store::RecordStore;
use super::sync::{sync_config, SyncOutcome};
use crate::protocol::{
    CommandOutcome, DeviceAction, HeartbeatRequest, PendingDeviceCommand, ReadingPayload,
};

/// Reported when a new network could not be joined and the old one was restored.
const WIFI_ROLLBACK_MESSAGE: &str = "WiFi connection failed, restored backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No valid record; waiting for identity and network credentials.
    Provisioning,
    Running,
}

/// What a long press did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    /// Network credentials cleared.
    Network,
    /// Whole record erased, including the secret.
    Factory,
}

#[derive(Debug, Default)]
struct Timers {
    heartbeat: Option<Instant>,
    poll: Option<Instant>,
    sensors: Option<Instant>,
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |at| now.duration_since(at) >= interval)
}

pub struct Agent<A, S, B> {
    config: AgentConfig,
    api: A,
    store: S,
    board: B,
    record: Option<DeviceRecord>,
    timers: Timers,
}

impl<A, S, B> Agent<A, S, B>
where
    A: DeviceApi,
    S: RecordStore,
    B: Board,
{
    pub fn new(config: AgentConfig, api: A, store: S, board: B) -> Self {
        Self {
            config,
            api,
            store,
            board,
            record: None,
            timers: Timers::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        if self.record.is_some() {
            Mode::Running
        } else {
            Mode::Provisioning
        }
    }

    pub fn record(&self) -> Option<&DeviceRecord> {
        self.record.as_ref()
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load the stored record. A missing, corrupt or incomplete record
    /// leaves the agent in provisioning mode.
    pub async fn boot(&mut self) -> Result<Mode, AgentError> {
        self.record = None;
        self.timers = Timers::default();

        let mut record = match self.store.load().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::info!("No stored record; entering provisioning mode");
                return Ok(Mode::Provisioning);
            }
            Err(AgentError::StorageCorruption(reason)) => {
                tracing::warn!("Stored record invalid ({}); entering provisioning mode", reason);
                return Ok(Mode::Provisioning);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = record.validate() {
            tracing::warn!("{}; entering provisioning mode", e);
            return Ok(Mode::Provisioning);
        }
        if record.sanitize_config_version() {
            if let Err(e) = self.store.save(&record).await {
                tracing::warn!("Could not persist reset config version: {}", e);
            }
        }

        tracing::info!(
            "Booted as {} on '{}' (config v{})",
            record.composite_id,
            record.wifi.ssid,
            record.config_version
        );
        self.board.configure(&record);
        self.record = Some(record);
        Ok(Mode::Running)
    }

    /// Store identity and network credentials and start running. An earlier
    /// record for the same identity keeps its secret.
    pub async fn provision(
        &mut self,
        composite_id: &str,
        wifi: WifiCredentials,
    ) -> Result<(), AgentError> {
        let mut record = DeviceRecord::provision(composite_id, wifi)?;
        if let Ok(Some(previous)) = self.store.load().await {
            record.carry_over(&previous);
        }
        self.store.save(&record).await?;

        tracing::info!("Provisioned as {}", record.composite_id);
        self.board.configure(&record);
        self.record = Some(record);
        self.timers = Timers::default();
        Ok(())
    }

    /// Switch to new network credentials, keeping the old ones as backup.
    pub async fn change_wifi(&mut self, wifi: WifiCredentials) -> Result<(), AgentError> {
        let Some(record) = self.record.as_ref() else {
            return Err(AgentError::NotProvisioned("no record".into()));
        };
        let mut updated = record.clone();
        updated.change_wifi(wifi);
        self.store.save(&updated).await?;
        self.record = Some(updated);
        Ok(())
    }

    /// Fall back to the backup network. Returns false when there is none.
    pub async fn restore_wifi_backup(&mut self) -> Result<bool, AgentError> {
        let Some(record) = self.record.as_ref() else {
            return Ok(false);
        };
        let mut updated = record.clone();
        if !updated.restore_wifi_backup() {
            return Ok(false);
        }
        self.store.save(&updated).await?;
        self.record = Some(updated);
        Ok(true)
    }

    /// Run forever.
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.boot().await?;
        loop {
            self.tick().await?;
            tokio::time::sleep(self.config.tick).await;
        }
    }

    /// One loop iteration.
    pub async fn tick(&mut self) -> Result<(), AgentError> {
        if let Some(level) = self.check_button().await? {
            tracing::warn!("Reset {:?} complete; rebooting", level);
            self.board.reboot();
            self.boot().await?;
            return Ok(());
        }

        if self.record.is_none() {
            self.try_provision_from_config().await;
            return Ok(());
        }

        let now = Instant::now();
        if due(self.timers.heartbeat, self.config.heartbeat_interval, now) {
            self.timers.heartbeat = Some(now);
            if let Some(command) = self.heartbeat().await {
                if self.run_device_command(command).await {
                    self.board.reboot();
                    self.boot().await?;
                    return Ok(());
                }
            }
        }
        if due(self.timers.poll, self.config.command_poll_interval, now) {
            self.timers.poll = Some(now);
            self.poll_commands().await;
        }
        if due(self.timers.sensors, self.config.sensor_interval, now) {
            self.timers.sensors = Some(now);
            self.push_readings().await;
        }
        Ok(())
    }

    /// Block while the button is held, showing a countdown, then apply the
    /// reset level the hold reached.
    async fn check_button(&mut self) -> Result<Option<ResetLevel>, AgentError> {
        if !self.board.button_held() {
            return Ok(None);
        }

        let start = Instant::now();
        let mut shown = 0;
        while self.board.button_held() && start.elapsed() < self.config.factory_reset_hold {
            let held = start.elapsed().as_secs();
            if held > shown {
                shown = held;
                self.board.show_countdown(held);
            }
            tokio::time::sleep(self.config.tick).await;
        }
        let held = start.elapsed();

        if held >= self.config.factory_reset_hold {
            tracing::warn!("Factory reset: erasing identity, secret and config");
            self.store.clear().await?;
            self.record = None;
            Ok(Some(ResetLevel::Factory))
        } else if held >= self.config.reset_network_hold {
            tracing::warn!("Network reset: clearing WiFi credentials");
            let loaded = match self.record.take() {
                Some(record) => Some(record),
                None => self.store.load().await.ok().flatten(),
            };
            if let Some(mut record) = loaded {
                record.clear_network();
                self.store.save(&record).await?;
            }
            Ok(Some(ResetLevel::Network))
        } else {
            tracing::debug!("Button released after {:?}; ignoring", held);
            Ok(None)
        }
    }

    async fn try_provision_from_config(&mut self) {
        let (Some(device_id), Some(ssid)) = (
            self.config.provision_device_id.clone(),
            self.config.provision_wifi_ssid.clone(),
        ) else {
            return;
        };
        let wifi = WifiCredentials {
            ssid,
            password: self.config.provision_wifi_password.clone(),
        };
        if let Err(e) = self.provision(&device_id, wifi).await {
            tracing::warn!("Provisioning failed: {}", e);
        }
    }

    fn identity(&self) -> Option<Identity> {
        self.record.as_ref().map(|r| Identity {
            composite_id: r.composite_id.clone(),
            secret: r.secret.clone(),
        })
    }

    /// Report liveness and sync config. Returns the device-level command the
    /// server handed out, if any.
    async fn heartbeat(&mut self) -> Option<PendingDeviceCommand> {
        let identity = self.identity()?;
        let req = HeartbeatRequest {
            firmware_version: self.config.firmware_version.clone(),
            hostname: self.board.hostname(),
            ip_address: self.board.ip_address(),
            rssi: self.board.rssi(),
        };

        let response = match self.api.heartbeat(&identity, &req).await {
            Ok(response) => response,
            Err(e) if e.is_auth_rejection() => {
                tracing::error!(
                    "Server rejected identity {}: {}; an operator must reprovision it",
                    identity.composite_id,
                    e
                );
                return None;
            }
            Err(e) => {
                tracing::warn!("Heartbeat failed: {}", e);
                return None;
            }
        };

        let record = self.record.as_mut()?;
        match sync_config(&self.api, &self.store, &identity, record, response.config_version).await {
            Ok(SyncOutcome::Applied { .. }) => self.board.configure(record),
            Ok(SyncOutcome::UpToDate) => {}
            Err(e) => tracing::warn!("Config sync failed: {}", e),
        }
        response.device_command
    }

    /// Carry out a device-level command. Returns true when the device must
    /// restart.
    async fn run_device_command(&mut self, command: PendingDeviceCommand) -> bool {
        let Some(identity) = self.identity() else {
            return false;
        };
        let id = command.command_id;
        match command.action {
            DeviceAction::Reset => {
                tracing::warn!("Restart requested by server (command {})", id);
                self.acknowledge(&identity, &id, Ok(())).await;
                true
            }
            DeviceAction::WifiUpdate { ssid, password } => {
                let wifi = WifiCredentials { ssid, password };
                tracing::info!("Switching to network '{}' (command {})", wifi.ssid, id);
                if let Err(e) = self.change_wifi(wifi.clone()).await {
                    let reason = format!("could not store WiFi credentials: {}", e);
                    self.acknowledge(&identity, &id, Err(reason)).await;
                    return false;
                }
                if self.board.connect_wifi(&wifi) {
                    self.acknowledge(&identity, &id, Ok(())).await;
                    return true;
                }

                match self.restore_wifi_backup().await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!("No backup network to fall back to"),
                    Err(e) => tracing::error!("Could not persist restored network: {}", e),
                }
                let current = self
                    .record
                    .as_ref()
                    .map(|r| r.wifi.clone())
                    .unwrap_or_default();
                if !self.board.connect_wifi(&current) {
                    tracing::error!("Could not rejoin '{}'; restarting", current.ssid);
                    return true;
                }
                self.acknowledge(&identity, &id, Err(WIFI_ROLLBACK_MESSAGE.into())).await;
                false
            }
        }
    }

    async fn acknowledge(&self, identity: &Identity, command_id: &str, result: Result<(), String>) {
        let (outcome, error_message) = match result {
            Ok(()) => (CommandOutcome::Confirmed, None),
            Err(reason) => (CommandOutcome::Failed, Some(reason)),
        };
        if let Err(e) = self
            .api
            .confirm_device_command(identity, command_id, outcome, error_message)
            .await
        {
            tracing::warn!("Could not acknowledge command {}: {}", command_id, e);
        }
    }

    async fn poll_commands(&mut self) {
        let Some(identity) = self.identity() else {
            return;
        };
        let commands = match self.api.poll_commands(&identity).await {
            Ok(commands) => commands,
            Err(e) => {
                tracing::warn!("Command poll failed: {}", e);
                return;
            }
        };

        for command in commands {
            let slot = self.record.as_ref().and_then(|r| {
                r.actuators
                    .iter()
                    .find(|a| a.port_id == command.actuator_local_id)
                    .cloned()
            });
            let result = match slot {
                Some(slot) => self.board.actuate(&slot, command.kind, command.value),
                None => Err(format!("unknown actuator {}", command.actuator_local_id)),
            };
            let (outcome, error_message) = match result {
                Ok(()) => (CommandOutcome::Confirmed, None),
                Err(reason) => {
                    tracing::warn!("Command {} failed: {}", command.command_id, reason);
                    (CommandOutcome::Failed, Some(reason))
                }
            };
            if let Err(e) = self
                .api
                .confirm_command(&identity, &command.command_id, outcome, error_message)
                .await
            {
                tracing::warn!("Could not confirm command {}: {}", command.command_id, e);
            }
        }
    }

    async fn push_readings(&mut self) {
        let Some(identity) = self.identity() else {
            return;
        };
        let sensors = self
            .record
            .as_ref()
            .map(|r| r.sensors.clone())
            .unwrap_or_default();
        let readings: Vec<ReadingPayload> = sensors
            .iter()
            .filter_map(|slot| {
                self.board.read_sensor(slot).map(|value| ReadingPayload {
                    local_sensor_id: slot.port_id.clone(),
                    declared_type: slot.sensor_type.clone(),
                    value,
                    unit: None,
                })
            })
            .collect();
        if readings.is_empty() {
            return;
        }
        match self.api.push_readings(&identity, readings).await {
            Ok(count) => tracing::debug!("Pushed {} reading(s)", count),
            Err(e) => tracing::warn!("Readings push failed: {}", e),
        }
    }
}
