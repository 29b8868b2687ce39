//! Authoritative sensor/actuator configuration behind a per-device version.
//!
//! The version counter is bumped by database triggers whenever a device's
//! port rows change in a configuration-relevant way, so every write path
//! (operator edits, auto-discovery) advances it without cooperating.
//! Devices poll the version with their heartbeat and fetch the full snapshot
//! when it moved; they never receive diffs.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::db::{
    self,
    models::{Actuator, Sensor},
    queries,
};
use crate::discovery;
use crate::error::{ApiError, ApiResult};
use crate::protocol::{
    ActuatorAnnouncement, Announcement, ConfigEntry, ConfigSnapshot, EntryKind, SensorAnnouncement,
};
use crate::ws::WsEvent;

/// Operator edit of a sensor's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub sensor_type: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

/// Operator edit of an actuator's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    pub actuator_type: String,
    #[serde(default)]
    pub supports_pwm: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

pub struct ConfigSyncService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
}

impl ConfigSyncService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        ConfigSyncService { pool, event_tx }
    }

    pub async fn current_version(&self, device_id: &str) -> ApiResult<i64> {
        queries::get_config_version(&self.pool, device_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Device {}", device_id)))
    }

    /// Register any announced ports, then read the active configuration and
    /// the version it corresponds to in one transaction.
    pub async fn fetch(
        &self,
        device_id: &str,
        announce: Option<&Announcement>,
        now: DateTime<Utc>,
    ) -> ApiResult<ConfigSnapshot> {
        let mut tx = self.pool.begin().await?;

        let mut discovered = Vec::new();
        if let Some(announcement) = announce {
            discovered = discovery::register_announcement(
                &mut tx,
                device_id,
                announcement,
                &db::timestamp(now),
            )
            .await?;
        }

        let config_version = queries::get_config_version(&mut *tx, device_id)
            .await?
            .ok_or_else(|| ApiError::IdentityNotFound(device_id.to_string()))?;
        let sensors = queries::list_active_sensors(&mut *tx, device_id).await?;
        let actuators = queries::list_active_actuators(&mut *tx, device_id).await?;
        tx.commit().await?;

        for (local_id, kind) in discovered {
            let _ = self.event_tx.send(WsEvent::PortDiscovered {
                device_id: device_id.to_string(),
                local_id,
                kind: kind.to_string(),
            });
        }

        tracing::debug!(
            "Config snapshot for {} at v{}: {} sensors, {} actuators",
            device_id,
            config_version,
            sensors.len(),
            actuators.len()
        );
        Ok(build_snapshot(config_version, &sensors, &actuators))
    }

    // ─── Operator edits ──────────────────────────────────────────────────

    pub async fn upsert_sensor(
        &self,
        device_id: &str,
        local_id: &str,
        config: &SensorConfig,
        now: DateTime<Utc>,
    ) -> ApiResult<Sensor> {
        self.ensure_device(device_id).await?;
        let announcement = SensorAnnouncement {
            local_id: local_id.to_string(),
            declared_type: config.sensor_type.trim().to_string(),
            unit: config.unit.clone(),
            name: config.name.clone(),
        };

        let mut tx = self.pool.begin().await?;
        let mut sensor =
            discovery::register_sensor(&mut tx, device_id, &announcement, &db::timestamp(now))
                .await?
                .record;
        tx.commit().await?;

        if !config.is_active {
            queries::set_sensor_active(&self.pool, device_id, local_id, false).await?;
            sensor.is_active = false;
        }
        tracing::info!("Sensor {} on {} configured as {}", local_id, device_id, sensor.sensor_type);
        Ok(sensor)
    }

    pub async fn upsert_actuator(
        &self,
        device_id: &str,
        local_id: &str,
        config: &ActuatorConfig,
        now: DateTime<Utc>,
    ) -> ApiResult<Actuator> {
        self.ensure_device(device_id).await?;
        let announcement = ActuatorAnnouncement {
            local_id: local_id.to_string(),
            declared_type: config.actuator_type.trim().to_string(),
            supports_pwm: config.supports_pwm,
        };

        let mut tx = self.pool.begin().await?;
        let mut actuator =
            discovery::register_actuator(&mut tx, device_id, &announcement, &db::timestamp(now))
                .await?
                .record;
        tx.commit().await?;

        if !config.is_active {
            queries::set_actuator_active(&self.pool, device_id, local_id, false).await?;
            actuator.is_active = false;
        }
        tracing::info!("Actuator {} on {} configured as {}", local_id, device_id, actuator.actuator_type);
        Ok(actuator)
    }

    pub async fn remove_sensor(&self, device_id: &str, local_id: &str) -> ApiResult<()> {
        if !queries::delete_sensor(&self.pool, device_id, local_id).await? {
            return Err(ApiError::NotFound(format!("Sensor {} on {}", local_id, device_id)));
        }
        Ok(())
    }

    pub async fn remove_actuator(&self, device_id: &str, local_id: &str) -> ApiResult<()> {
        if !queries::delete_actuator(&self.pool, device_id, local_id).await? {
            return Err(ApiError::NotFound(format!("Actuator {} on {}", local_id, device_id)));
        }
        Ok(())
    }

    async fn ensure_device(&self, device_id: &str) -> ApiResult<()> {
        queries::get_device(&self.pool, device_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("Device {}", device_id)))
    }
}

/// Sensors first, then actuators, each ordered by port id.
pub fn build_snapshot(
    config_version: i64,
    sensors: &[Sensor],
    actuators: &[Actuator],
) -> ConfigSnapshot {
    let mut entries: Vec<ConfigEntry> = sensors
        .iter()
        .filter(|s| s.is_active)
        .map(|s| ConfigEntry {
            kind: EntryKind::Sensor,
            entry_type: s.sensor_type.clone(),
            port_id: s.local_id.clone(),
            supports_pwm: false,
        })
        .collect();
    let sensor_count = entries.len();

    entries.extend(actuators.iter().filter(|a| a.is_active).map(|a| ConfigEntry {
        kind: EntryKind::Actuator,
        entry_type: a.actuator_type.clone(),
        port_id: a.local_id.clone(),
        supports_pwm: a.supports_pwm,
    }));
    entries[..sensor_count].sort_by(|a, b| a.port_id.cmp(&b.port_id));
    entries[sensor_count..].sort_by(|a, b| a.port_id.cmp(&b.port_id));

    ConfigSnapshot {
        config_version,
        entries,
    }
}
