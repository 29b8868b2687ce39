//! Hardware seam: button, sensors, actuators and network identity.

use std::collections::HashMap;
use std::path::PathBuf;

use super::record::{ActuatorSlot, DeviceRecord, SensorSlot, WifiCredentials};
use crate::protocol::CommandKind;

pub trait Board: Send {
    /// True while the reset button is held.
    fn button_held(&self) -> bool;

    /// Re-initialize drivers for the record's port map.
    fn configure(&mut self, record: &DeviceRecord);

    fn read_sensor(&mut self, slot: &SensorSlot) -> Option<f64>;

    /// Drive an actuator. `Err` carries the reason reported back to the server.
    fn actuate(
        &mut self,
        slot: &ActuatorSlot,
        kind: CommandKind,
        value: Option<i64>,
    ) -> Result<(), String>;

    /// Try to join a network. False if it could not be joined in time.
    fn connect_wifi(&mut self, wifi: &WifiCredentials) -> bool;

    /// Show reset countdown progress.
    fn show_countdown(&mut self, held_secs: u64);

    /// Restart the device. A simulated board just records the request.
    fn reboot(&mut self);

    fn hostname(&self) -> Option<String>;
    fn ip_address(&self) -> Option<String>;
    fn rssi(&self) -> Option<i64>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActuatorState {
    pub is_on: bool,
    pub value: Option<i64>,
}

/// Board used off-hardware. The button is held while `button_path` exists.
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    button_path: Option<PathBuf>,
    configured_ports: Vec<String>,
    actuators: HashMap<String, ActuatorState>,
    unreachable: Vec<String>,
    tick: u64,
    /// Network last joined.
    pub network: Option<String>,
    pub reboots: u32,
}

impl SimulatedBoard {
    pub fn new(button_path: Option<PathBuf>) -> Self {
        Self {
            button_path,
            ..Self::default()
        }
    }

    /// Make joining `ssid` fail.
    pub fn unreachable(mut self, ssid: &str) -> Self {
        self.unreachable.push(ssid.to_string());
        self
    }

    pub fn actuator(&self, port_id: &str) -> Option<ActuatorState> {
        self.actuators.get(port_id).copied()
    }
}

impl Board for SimulatedBoard {
    fn button_held(&self) -> bool {
        self.button_path.as_ref().map_or(false, |p| p.exists())
    }

    fn configure(&mut self, record: &DeviceRecord) {
        self.configured_ports = record
            .sensors
            .iter()
            .map(|s| s.port_id.clone())
            .chain(record.actuators.iter().map(|a| a.port_id.clone()))
            .collect();
        self.actuators
            .retain(|port, _| record.actuators.iter().any(|a| &a.port_id == port));
        tracing::info!("Drivers configured for {} port(s)", self.configured_ports.len());
    }

    fn read_sensor(&mut self, slot: &SensorSlot) -> Option<f64> {
        if !self.configured_ports.contains(&slot.port_id) {
            return None;
        }
        self.tick += 1;
        let wobble = (self.tick % 10) as f64 / 10.0;
        let value = match slot.sensor_type.as_str() {
            t if t.contains("temp") => 21.0 + wobble,
            t if t.contains("humidity") => 55.0 + wobble,
            "soil_moisture" => 40.0 + wobble,
            "water_level" => 70.0,
            _ => wobble,
        };
        Some(value)
    }

    fn actuate(
        &mut self,
        slot: &ActuatorSlot,
        kind: CommandKind,
        value: Option<i64>,
    ) -> Result<(), String> {
        if !self.configured_ports.contains(&slot.port_id) {
            return Err(format!("{} is not configured", slot.port_id));
        }
        let state = match kind {
            CommandKind::On => ActuatorState { is_on: true, value: None },
            CommandKind::Off => ActuatorState { is_on: false, value: None },
            CommandKind::SetValue if slot.supports_pwm => {
                let v = value.ok_or("set_value without a value")?;
                ActuatorState { is_on: v > 0, value: Some(v) }
            }
            CommandKind::SetValue => return Err(format!("{} has no PWM", slot.port_id)),
        };
        self.actuators.insert(slot.port_id.clone(), state);
        Ok(())
    }

    fn connect_wifi(&mut self, wifi: &WifiCredentials) -> bool {
        if !wifi.is_set() || self.unreachable.contains(&wifi.ssid) {
            tracing::warn!("Could not join '{}'", wifi.ssid);
            return false;
        }
        tracing::info!("Joined '{}'", wifi.ssid);
        self.network = Some(wifi.ssid.clone());
        true
    }

    fn show_countdown(&mut self, held_secs: u64) {
        tracing::warn!("Reset button held for {}s", held_secs);
    }

    fn reboot(&mut self) {
        self.reboots += 1;
        tracing::warn!("Reboot requested");
    }

    fn hostname(&self) -> Option<String> {
        hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().to_string())
    }

    fn ip_address(&self) -> Option<String> {
        local_ip_address::local_ip().ok().map(|ip| ip.to_string())
    }

    fn rssi(&self) -> Option<i64> {
        None
    }
}
