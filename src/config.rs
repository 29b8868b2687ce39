use std::time::Duration;

/// Server tunables, read from the environment with the protocol defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub port: u16,
    /// Silence after which an online device is demoted to offline.
    pub liveness_window: Duration,
    /// Minimum age of a never-contacted registration before it is flagged `connection_failed`.
    pub join_grace: Duration,
    pub command_expiry: Duration,
    pub command_batch_size: u32,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            database_url: "sqlite:./data/greenhouse.db".to_string(),
            port: 8080,
            liveness_window: Duration::from_secs(5 * 60),
            join_grace: Duration::from_secs(30),
            command_expiry: Duration::from_secs(5 * 60),
            command_batch_size: 5,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            port: env_parse("PORT", defaults.port)?,
            liveness_window: env_secs("LIVENESS_WINDOW_SECS", defaults.liveness_window)?,
            join_grace: env_secs("JOIN_GRACE_SECS", defaults.join_grace)?,
            command_expiry: env_secs("COMMAND_EXPIRY_SECS", defaults.command_expiry)?,
            command_batch_size: env_parse("COMMAND_BATCH_SIZE", defaults.command_batch_size)?,
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

pub(crate) fn env_secs(key: &str, default: Duration) -> anyhow::Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
