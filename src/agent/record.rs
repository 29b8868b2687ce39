//! The device's persisted record.
//!
//! Everything the device needs across reboots lives in one [`DeviceRecord`]:
//! identity, network credentials, its self-generated secret, the port map
//! from the last config sync, and the config version that map corresponds to.
//! It is stored as a JSON payload wrapped in a SHA-256 checksum envelope; a
//! mismatch on load means "no valid config".

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use super::error::AgentError;
use crate::protocol::{ConfigSnapshot, EntryKind};
use crate::utils::sha256_hex;

pub const MAX_SENSORS: usize = 4;
pub const MAX_ACTUATORS: usize = 4;
/// Cached versions outside `0..=MAX_CONFIG_VERSION` are treated as garbage.
pub const MAX_CONFIG_VERSION: i64 = 10_000;
const SECRET_BYTES: usize = 32;
const UNCONFIGURED: &str = "unconfigured";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn is_set(&self) -> bool {
        !self.ssid.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSlot {
    pub port_id: String,
    pub sensor_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorSlot {
    pub port_id: String,
    pub actuator_type: String,
    pub supports_pwm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub composite_id: String,
    pub wifi: WifiCredentials,
    /// Previous credentials, kept when the network is changed.
    #[serde(default)]
    pub wifi_backup: Option<WifiCredentials>,
    pub secret: String,
    #[serde(default)]
    pub sensors: Vec<SensorSlot>,
    #[serde(default)]
    pub actuators: Vec<ActuatorSlot>,
    #[serde(default)]
    pub config_version: i64,
}

/// 32 random bytes as 64 lowercase hex characters.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_well_formed_secret(secret: &str) -> bool {
    secret.len() == SECRET_BYTES * 2 && secret.chars().all(|c| c.is_ascii_hexdigit())
}

impl DeviceRecord {
    /// A fresh record for a newly provisioned device, with a new secret.
    pub fn provision(composite_id: &str, wifi: WifiCredentials) -> Result<Self, AgentError> {
        let record = DeviceRecord {
            composite_id: composite_id.trim().to_ascii_uppercase(),
            wifi,
            wifi_backup: None,
            secret: generate_secret(),
            sensors: Vec::new(),
            actuators: Vec::new(),
            config_version: 0,
        };
        record.validate()?;
        Ok(record)
    }

    /// A record is usable only with an identity, a network and a well-formed secret.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.composite_id.is_empty() {
            return Err(AgentError::NotProvisioned("no device id".into()));
        }
        if !self.wifi.is_set() {
            return Err(AgentError::NotProvisioned("no WiFi SSID".into()));
        }
        if !is_well_formed_secret(&self.secret) {
            return Err(AgentError::NotProvisioned("malformed device secret".into()));
        }
        Ok(())
    }

    /// Keep the secret and port map of an earlier record for the same
    /// identity, so re-entering network credentials does not lock the device
    /// out of its server binding.
    pub fn carry_over(&mut self, previous: &DeviceRecord) {
        if previous.composite_id != self.composite_id || !is_well_formed_secret(&previous.secret) {
            return;
        }
        self.secret = previous.secret.clone();
        self.sensors = previous.sensors.clone();
        self.actuators = previous.actuators.clone();
        self.config_version = previous.config_version;
    }

    /// Reset an implausible cached version to 0 so the next heartbeat forces a
    /// sync. Returns true when the record changed.
    pub fn sanitize_config_version(&mut self) -> bool {
        if (0..=MAX_CONFIG_VERSION).contains(&self.config_version) {
            return false;
        }
        tracing::warn!(
            "Invalid cached config_version {}; resetting to 0 to force a sync",
            self.config_version
        );
        self.config_version = 0;
        true
    }

    /// The record after fully replacing the port map with `snapshot`.
    ///
    /// Applying the same snapshot twice yields the same record.
    pub fn with_snapshot(&self, snapshot: &ConfigSnapshot) -> DeviceRecord {
        let mut sensors = Vec::new();
        let mut actuators = Vec::new();
        for entry in &snapshot.entries {
            if entry.entry_type == UNCONFIGURED {
                continue;
            }
            match entry.kind {
                EntryKind::Sensor if sensors.len() < MAX_SENSORS => sensors.push(SensorSlot {
                    port_id: entry.port_id.clone(),
                    sensor_type: entry.entry_type.clone(),
                }),
                EntryKind::Actuator if actuators.len() < MAX_ACTUATORS => {
                    actuators.push(ActuatorSlot {
                        port_id: entry.port_id.clone(),
                        actuator_type: entry.entry_type.clone(),
                        supports_pwm: entry.supports_pwm,
                    })
                }
                _ => tracing::warn!(
                    "No free slot for {:?} on {}; ignoring",
                    entry.kind,
                    entry.port_id
                ),
            }
        }

        DeviceRecord {
            sensors,
            actuators,
            config_version: snapshot.config_version,
            ..self.clone()
        }
    }

    /// Switch networks, keeping the current credentials as the backup.
    pub fn change_wifi(&mut self, wifi: WifiCredentials) {
        if self.wifi.is_set() {
            self.wifi_backup = Some(std::mem::take(&mut self.wifi));
        }
        self.wifi = wifi;
    }

    /// Swap back to the backup credentials. Returns false when there is none.
    pub fn restore_wifi_backup(&mut self) -> bool {
        match self.wifi_backup.take() {
            Some(backup) if backup.is_set() => {
                self.wifi = backup;
                true
            }
            _ => false,
        }
    }

    /// Level-1 reset: forget network credentials and their backup.
    pub fn clear_network(&mut self) {
        self.wifi = WifiCredentials::default();
        self.wifi_backup = None;
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: String,
}

/// Serialize with a checksum over the exact payload bytes.
pub fn seal(record: &DeviceRecord) -> Result<Vec<u8>, AgentError> {
    let payload = serde_json::to_string(record)?;
    let envelope = Envelope {
        checksum: sha256_hex(payload.as_bytes()),
        payload,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

pub fn unseal(bytes: &[u8]) -> Result<DeviceRecord, AgentError> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| AgentError::StorageCorruption(format!("unreadable envelope: {}", e)))?;
    if sha256_hex(envelope.payload.as_bytes()) != envelope.checksum {
        return Err(AgentError::StorageCorruption("checksum mismatch".into()));
    }
    serde_json::from_str(&envelope.payload)
        .map_err(|e| AgentError::StorageCorruption(format!("unreadable record: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConfigEntry;

    fn record() -> DeviceRecord {
        DeviceRecord::provision(
            "proj1-esp5",
            WifiCredentials {
                ssid: "greenhouse".into(),
                password: "hunter2".into(),
            },
        )
        .unwrap()
    }

    fn entry(kind: EntryKind, entry_type: &str, port: &str) -> ConfigEntry {
        ConfigEntry {
            kind,
            entry_type: entry_type.into(),
            port_id: port.into(),
            supports_pwm: false,
        }
    }

    #[test]
    fn provisioning_generates_hex_secret() {
        let r = record();
        assert_eq!(r.composite_id, "PROJ1-ESP5");
        assert_eq!(r.secret.len(), 64);
        assert!(r.secret.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(r.secret, record().secret);
    }

    #[test]
    fn seal_round_trips_and_detects_tampering() {
        let r = record();
        let sealed = seal(&r).unwrap();
        assert_eq!(unseal(&sealed).unwrap(), r);

        let tampered = String::from_utf8(sealed).unwrap().replace("greenhouse", "neighbour");
        assert!(matches!(
            unseal(tampered.as_bytes()),
            Err(AgentError::StorageCorruption(_))
        ));
        assert!(matches!(unseal(b"\x00\x01garbage"), Err(AgentError::StorageCorruption(_))));
    }

    #[test]
    fn full_replace_is_idempotent_and_bounded() {
        let mut entries: Vec<_> = (0..6)
            .map(|i| entry(EntryKind::Sensor, "temperature", &format!("GPIO{}", i)))
            .collect();
        entries.push(entry(EntryKind::Sensor, "unconfigured", "A0"));
        entries.push(entry(EntryKind::Actuator, "fan", "GPIO12"));
        let snapshot = ConfigSnapshot {
            config_version: 7,
            entries,
        };

        let once = record().with_snapshot(&snapshot);
        assert_eq!(once.sensors.len(), MAX_SENSORS);
        assert_eq!(once.actuators.len(), 1);
        assert_eq!(once.config_version, 7);
        assert_eq!(once.with_snapshot(&snapshot), once);

        let emptied = once.with_snapshot(&ConfigSnapshot {
            config_version: 8,
            entries: vec![],
        });
        assert!(emptied.sensors.is_empty() && emptied.actuators.is_empty());
        assert_eq!(emptied.secret, once.secret);
    }

    #[test]
    fn implausible_version_is_reset() {
        let mut r = record();
        r.config_version = 10_001;
        assert!(r.sanitize_config_version());
        assert_eq!(r.config_version, 0);
        r.config_version = 42;
        assert!(!r.sanitize_config_version());
        r.config_version = -3;
        assert!(r.sanitize_config_version());
    }

    #[test]
    fn wifi_backup_survives_change_and_restores() {
        let mut r = record();
        r.change_wifi(WifiCredentials {
            ssid: "barn".into(),
            password: "x".into(),
        });
        assert_eq!(r.wifi.ssid, "barn");
        assert!(r.restore_wifi_backup());
        assert_eq!(r.wifi.ssid, "greenhouse");
        assert!(!r.restore_wifi_backup());

        r.clear_network();
        assert!(matches!(r.validate(), Err(AgentError::NotProvisioned(_))));
    }
}
