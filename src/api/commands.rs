use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    commands::NewCommand,
    error::ApiResult,
    protocol::DeviceAction,
    AppState,
};

/// POST /api/devices/:id/actuators/:local_id/commands
pub async fn issue_command(
    State(state): State<Arc<AppState>>,
    Path((id, local_id)): Path<(String, String)>,
    Json(req): Json<NewCommand>,
) -> ApiResult<impl IntoResponse> {
    let command = state
        .commands()
        .enqueue(&id, &local_id, &req, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(command)))
}

/// GET /api/devices/:id/commands  (newest first)
pub async fn list_commands(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let commands = state.commands().list(&id).await?;
    Ok(Json(serde_json::json!({ "commands": commands })))
}

/// POST /api/devices/:id/device-commands  (`{"kind":"reset"}` or
/// `{"kind":"wifi_update","ssid":..,"password":..}`)
pub async fn issue_device_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(action): Json<DeviceAction>,
) -> ApiResult<impl IntoResponse> {
    let command = state
        .commands()
        .enqueue_device_command(&id, &action, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(command)))
}

/// GET /api/devices/:id/device-commands
pub async fn list_device_commands(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let commands = state.commands().list_device_commands(&id).await?;
    Ok(Json(serde_json::json!({ "commands": commands })))
}
