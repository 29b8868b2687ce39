use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::timestamp;

// ─── Device ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String, // composite id, e.g. PROJ1-ESP5
    pub project_code: String,
    pub slot: i64,
    pub name: String,
    #[serde(skip)]
    pub secret_hash: Option<String>,
    pub revoked: bool,
    pub status: String, // offline | online | connection_failed
    pub last_contact_at: Option<String>,
    pub registered_at: String,
    pub firmware_version: Option<String>,
    pub config_version: i64,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub rssi: Option<i64>,
}

impl Device {
    pub fn new(project_code: String, slot: i64, name: String, now: DateTime<Utc>) -> Self {
        Device {
            id: format!("{}-ESP{}", project_code, slot),
            project_code,
            slot,
            name,
            secret_hash: None,
            revoked: false,
            status: "offline".into(),
            last_contact_at: None,
            registered_at: timestamp(now),
            firmware_version: None,
            config_version: 0,
            hostname: None,
            ip_address: None,
            rssi: None,
        }
    }

    /// True once a secret has been bound on first contact.
    pub fn is_bound(&self) -> bool {
        self.secret_hash.is_some()
    }
}

// ─── Sensor / Actuator ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sensor {
    pub id: String,
    pub device_id: String,
    pub local_id: String, // port identifier, e.g. GPIO4
    pub sensor_type: String,
    pub unit: Option<String>,
    pub name: Option<String>,
    pub is_active: bool,
    pub discovered_at: String,
    pub last_seen_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actuator {
    pub id: String,
    pub device_id: String,
    pub local_id: String,
    pub actuator_type: String,
    pub supports_pwm: bool,
    pub is_on: bool,
    pub current_value: Option<i64>,
    pub is_active: bool,
    pub discovered_at: String,
}

// ─── Command ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Command {
    pub id: String,
    pub device_id: String,
    pub actuator_id: String,
    pub kind: String,   // on | off | set_value
    pub value: Option<i64>,
    pub status: String, // pending | retrieved | confirmed | failed | expired
    pub error_message: Option<String>,
    pub created_at: String,
    pub retrieved_at: Option<String>,
    pub confirmed_at: Option<String>,
    pub expires_at: String,
}

impl Command {
    pub fn new(
        device_id: String,
        actuator_id: String,
        kind: &str,
        value: Option<i64>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Command {
            id: Uuid::new_v4().to_string(),
            device_id,
            actuator_id,
            kind: kind.into(),
            value,
            status: "pending".into(),
            error_message: None,
            created_at: timestamp(now),
            retrieved_at: None,
            confirmed_at: None,
            expires_at: timestamp(expires_at),
        }
    }
}

// ─── Device command ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceCommand {
    pub id: String,
    pub device_id: String,
    pub kind: String, // reset | wifi_update
    pub wifi_ssid: Option<String>,
    #[serde(skip)]
    pub wifi_password: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub retrieved_at: Option<String>,
    pub confirmed_at: Option<String>,
    pub expires_at: String,
}

impl DeviceCommand {
    pub fn new(
        device_id: String,
        kind: &str,
        wifi: Option<(String, String)>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let (wifi_ssid, wifi_password) = match wifi {
            Some((ssid, password)) => (Some(ssid), Some(password)),
            None => (None, None),
        };
        DeviceCommand {
            id: Uuid::new_v4().to_string(),
            device_id,
            kind: kind.into(),
            wifi_ssid,
            wifi_password,
            status: "pending".into(),
            error_message: None,
            created_at: timestamp(now),
            retrieved_at: None,
            confirmed_at: None,
            expires_at: timestamp(expires_at),
        }
    }
}

// ─── Reading ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub sensor_id: String,
    pub value: f64,
    pub unit: Option<String>,
    pub recorded_at: String,
}
