//! Wire types shared by the server's device routes and the device agent.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const DEVICE_ID_HEADER: &str = "x-composite-device-id";
pub const DEVICE_KEY_HEADER: &str = "x-device-key";

// ─── Heartbeat ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub firmware_version: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub rssi: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub config_version: i64,
    pub timestamp: String,
    /// At most one device-level command per heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_command: Option<PendingDeviceCommand>,
}

// ─── Config sync ─────────────────────────────────────────────────────────────

/// Inline metadata a device sends along with a config fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(default)]
    pub sensors: Vec<SensorAnnouncement>,
    #[serde(default)]
    pub actuators: Vec<ActuatorAnnouncement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorAnnouncement {
    pub local_id: String,
    pub declared_type: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorAnnouncement {
    pub local_id: String,
    pub declared_type: String,
    #[serde(default)]
    pub supports_pwm: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfigRequest {
    #[serde(default)]
    pub announce: Option<Announcement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Sensor,
    Actuator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub kind: EntryKind,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub port_id: String,
    #[serde(default)]
    pub supports_pwm: bool,
}

/// Full active configuration of one device, read at `config_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config_version: i64,
    pub entries: Vec<ConfigEntry>,
}

// ─── Telemetry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingPayload {
    pub local_sensor_id: String,
    pub declared_type: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushReadingsRequest {
    pub readings: Vec<ReadingPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReadingsResponse {
    pub inserted_count: usize,
}

// ─── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    On,
    Off,
    SetValue,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::On => "on",
            CommandKind::Off => "off",
            CommandKind::SetValue => "set_value",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Retrieved,
    Confirmed,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Retrieved => "retrieved",
            CommandStatus::Confirmed => "confirmed",
            CommandStatus::Failed => "failed",
            CommandStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for CommandKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(CommandKind::On),
            "off" => Ok(CommandKind::Off),
            "set_value" => Ok(CommandKind::SetValue),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl FromStr for CommandStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "retrieved" => Ok(CommandStatus::Retrieved),
            "confirmed" => Ok(CommandStatus::Confirmed),
            "failed" => Ok(CommandStatus::Failed),
            "expired" => Ok(CommandStatus::Expired),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolledCommand {
    pub command_id: String,
    pub actuator_local_id: String,
    pub kind: CommandKind,
    #[serde(default)]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub commands: Vec<PolledCommand>,
}

/// What the device reports after executing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Confirmed,
    Failed,
}

impl CommandOutcome {
    pub fn status(&self) -> CommandStatus {
        match self {
            CommandOutcome::Confirmed => CommandStatus::Confirmed,
            CommandOutcome::Failed => CommandStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub outcome: CommandOutcome,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub ok: bool,
    pub status: CommandStatus,
}

// ─── Device commands ─────────────────────────────────────────────────────────

/// A device-level management action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceAction {
    /// Restart without touching stored state.
    Reset,
    /// Join a new network, falling back to the current one if it fails.
    WifiUpdate {
        ssid: String,
        #[serde(default)]
        password: String,
    },
}

impl DeviceAction {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceAction::Reset => "reset",
            DeviceAction::WifiUpdate { .. } => "wifi_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeviceCommand {
    pub command_id: String,
    #[serde(flatten)]
    pub action: DeviceAction,
}
