use anyhow::Result;
use chrono::Utc;
use greenhouse_link::{build_router, config::ServerConfig, db, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "greenhouse_link=debug,server=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("=== Greenhouse device link starting ===");

    let config = ServerConfig::from_env()?;
    tracing::info!(
        "Liveness window {:?}, join grace {:?}, command expiry {:?}",
        config.liveness_window,
        config.join_grace,
        config.command_expiry
    );

    // Database
    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database ready");

    let state = Arc::new(AppState::new(pool, config.clone()));

    // Status sweep and command expiry. Both are idempotent, so a missed or
    // overlapping tick is harmless.
    {
        let state_clone = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state_clone.config.sweep_interval);
            let liveness = state_clone.liveness();
            let commands = state_clone.commands();
            loop {
                ticker.tick().await;
                let now = Utc::now();
                if let Err(e) = liveness.sweep(now).await {
                    tracing::warn!("Liveness sweep failed: {}", e);
                }
                if let Err(e) = commands.expire(now).await {
                    tracing::warn!("Command expiry sweep failed: {}", e);
                }
            }
        });
    }

    // Build router
    let app = build_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
