use serde::{Deserialize, Serialize};

/// Events broadcast to connected operator clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// An operator pre-provisioned a new device identity
    DeviceRegistered { device_id: String, name: String },
    /// A device secret was bound on first contact
    SecretBound { device_id: String },
    /// Connection status changed (contact or sweep)
    DeviceStatusChanged { device_id: String, status: String },
    /// Authentication disabled for a device
    DeviceRevoked { device_id: String },
    /// Binding cleared; next contact rebinds
    DeviceReprovisioned { device_id: String },
    DeviceDeleted { device_id: String },
    /// A sensor or actuator was seen for the first time
    PortDiscovered {
        device_id: String,
        local_id: String,
        kind: String,
    },

    // ─── Command lifecycle ────────────────────────────────────────────────

    CommandQueued {
        command_id: String,
        device_id: String,
        actuator_local_id: String,
        kind: String,
    },
    /// Device-level command (reset, wifi_update) queued
    DeviceCommandQueued {
        command_id: String,
        device_id: String,
        kind: String,
    },
    CommandRetrieved { command_id: String, device_id: String },
    /// Device confirmed or reported failure
    CommandCompleted {
        command_id: String,
        device_id: String,
        status: String,
    },
    CommandExpired { command_id: String, device_id: String },
}

impl WsEvent {
    /// Device the event concerns, used to filter per-device subscriptions.
    pub fn device_id(&self) -> &str {
        match self {
            WsEvent::DeviceRegistered { device_id, .. }
            | WsEvent::SecretBound { device_id }
            | WsEvent::DeviceStatusChanged { device_id, .. }
            | WsEvent::DeviceRevoked { device_id }
            | WsEvent::DeviceReprovisioned { device_id }
            | WsEvent::DeviceDeleted { device_id }
            | WsEvent::PortDiscovered { device_id, .. }
            | WsEvent::CommandQueued { device_id, .. }
            | WsEvent::DeviceCommandQueued { device_id, .. }
            | WsEvent::CommandRetrieved { device_id, .. }
            | WsEvent::CommandCompleted { device_id, .. }
            | WsEvent::CommandExpired { device_id, .. } => device_id,
        }
    }
}
