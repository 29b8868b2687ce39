pub mod agent;
pub mod api;
pub mod commands;
pub mod config;
pub mod config_sync;
pub mod db;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod liveness;
pub mod protocol;
pub mod telemetry;
pub mod utils;
pub mod ws;

use axum::{
    routing::{get, post, put},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::commands::CommandQueue;
use crate::config::ServerConfig;
use crate::config_sync::ConfigSyncService;
use crate::identity::IdentityService;
use crate::liveness::LivenessTracker;
use crate::telemetry::TelemetryService;
use crate::ws::WsEvent;

// ─── App State ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub event_tx: broadcast::Sender<WsEvent>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: ServerConfig) -> Self {
        let (event_tx, _) = broadcast::channel::<WsEvent>(256);
        AppState {
            pool,
            event_tx,
            config,
        }
    }

    pub fn identity(&self) -> IdentityService {
        IdentityService::new(self.pool.clone(), self.event_tx.clone())
    }

    pub fn liveness(&self) -> LivenessTracker {
        LivenessTracker::new(
            self.pool.clone(),
            self.event_tx.clone(),
            self.config.liveness_window,
            self.config.join_grace,
        )
    }

    pub fn config_sync(&self) -> ConfigSyncService {
        ConfigSyncService::new(self.pool.clone(), self.event_tx.clone())
    }

    pub fn commands(&self) -> CommandQueue {
        CommandQueue::new(
            self.pool.clone(),
            self.event_tx.clone(),
            self.config.command_expiry,
            self.config.command_batch_size,
        )
    }

    pub fn telemetry(&self) -> TelemetryService {
        TelemetryService::new(self.pool.clone(), self.event_tx.clone())
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // WebSocket
        .route("/ws", get(api::ws_handler::ws_handler))
        // Device protocol
        .route("/device/heartbeat", post(api::device::heartbeat))
        .route("/device/config", post(api::device::fetch_config))
        .route("/device/readings", post(api::device::push_readings))
        .route("/device/commands/poll", post(api::device::poll_commands))
        .route("/device/commands/:id/confirm", post(api::device::confirm_command))
        .route(
            "/device/device-commands/:id/confirm",
            post(api::device::confirm_device_command),
        )
        // Devices
        .route(
            "/api/devices",
            get(api::devices::list_devices).post(api::devices::register_device),
        )
        .route(
            "/api/devices/:id",
            get(api::devices::get_device).delete(api::devices::delete_device),
        )
        .route("/api/devices/:id/revoke", post(api::devices::revoke_device))
        .route("/api/devices/:id/reprovision", post(api::devices::reprovision_device))
        // Sensor / actuator configuration
        .route("/api/devices/:id/config", get(api::config::get_snapshot))
        .route("/api/devices/:id/sensors", get(api::config::list_sensors))
        .route(
            "/api/devices/:id/sensors/:local_id",
            put(api::config::put_sensor).delete(api::config::delete_sensor),
        )
        .route("/api/devices/:id/actuators", get(api::config::list_actuators))
        .route(
            "/api/devices/:id/actuators/:local_id",
            put(api::config::put_actuator).delete(api::config::delete_actuator),
        )
        .route("/api/sensors/:sensor_id/readings", get(api::config::list_readings))
        // Commands
        .route(
            "/api/devices/:id/actuators/:local_id/commands",
            post(api::commands::issue_command),
        )
        .route("/api/devices/:id/commands", get(api::commands::list_commands))
        .route(
            "/api/devices/:id/device-commands",
            get(api::commands::list_device_commands).post(api::commands::issue_device_command),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
