use anyhow::Result;
use greenhouse_link::agent::{
    board::SimulatedBoard, client::HttpDeviceApi, store::FileStore, Agent, AgentConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "greenhouse_link=info,agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env()?;
    tracing::info!(
        "=== Greenhouse device agent {} -> {} ===",
        config.firmware_version,
        config.server_url
    );

    let api = HttpDeviceApi::new(&config.server_url, config.request_timeout)?;
    let store = FileStore::new(config.record_path.clone());
    let board = SimulatedBoard::new(config.button_path.clone());

    Agent::new(config, api, store, board).run().await?;
    Ok(())
}
