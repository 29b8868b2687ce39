use std::path::PathBuf;
use std::time::Duration;

use crate::config::{env_parse, env_secs};

/// Device agent tunables, read from `AGENT_*` environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub record_path: PathBuf,
    pub firmware_version: String,
    pub heartbeat_interval: Duration,
    pub sensor_interval: Duration,
    pub command_poll_interval: Duration,
    /// Sleep between loop iterations.
    pub tick: Duration,
    pub request_timeout: Duration,
    /// Hold time that clears network credentials.
    pub reset_network_hold: Duration,
    /// Hold time that wipes the whole record.
    pub factory_reset_hold: Duration,
    /// File whose presence simulates the reset button being held.
    pub button_path: Option<PathBuf>,
    /// Provisioning input, used only when no valid record is stored.
    pub provision_device_id: Option<String>,
    pub provision_wifi_ssid: Option<String>,
    pub provision_wifi_password: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            server_url: "http://localhost:8080".to_string(),
            record_path: PathBuf::from("./data/device-record.json"),
            firmware_version: format!("v{}", env!("CARGO_PKG_VERSION")),
            heartbeat_interval: Duration::from_secs(60),
            sensor_interval: Duration::from_secs(30),
            command_poll_interval: Duration::from_secs(30),
            tick: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
            reset_network_hold: Duration::from_secs(5),
            factory_reset_hold: Duration::from_secs(10),
            button_path: None,
            provision_device_id: None,
            provision_wifi_ssid: None,
            provision_wifi_password: String::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = AgentConfig::default();
        let optional = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Ok(AgentConfig {
            server_url: optional("AGENT_SERVER_URL").unwrap_or(defaults.server_url),
            record_path: optional("AGENT_RECORD_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.record_path),
            firmware_version: optional("AGENT_FIRMWARE_VERSION")
                .unwrap_or(defaults.firmware_version),
            heartbeat_interval: env_secs("AGENT_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            sensor_interval: env_secs("AGENT_SENSOR_SECS", defaults.sensor_interval)?,
            command_poll_interval: env_secs(
                "AGENT_COMMAND_POLL_SECS",
                defaults.command_poll_interval,
            )?,
            tick: Duration::from_millis(env_parse(
                "AGENT_TICK_MS",
                defaults.tick.as_millis() as u64,
            )?),
            request_timeout: env_secs("AGENT_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            reset_network_hold: defaults.reset_network_hold,
            factory_reset_hold: defaults.factory_reset_hold,
            button_path: optional("AGENT_BUTTON_PATH").map(PathBuf::from),
            provision_device_id: optional("AGENT_DEVICE_ID"),
            provision_wifi_ssid: optional("AGENT_WIFI_SSID"),
            provision_wifi_password: std::env::var("AGENT_WIFI_PASSWORD").unwrap_or_default(),
        })
    }
}
