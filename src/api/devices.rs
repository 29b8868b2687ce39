use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    db::queries,
    error::{ApiError, ApiResult},
    AppState,
};

#[derive(Deserialize)]
pub struct RegisterDeviceRequest {
    pub project_code: String,
    pub slot: i64,
    pub name: String,
}

/// GET /api/devices
pub async fn list_devices(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let devices = queries::list_devices(&state.pool).await?;
    Ok(Json(serde_json::json!({ "devices": devices })))
}

/// GET /api/devices/:id
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = queries::get_device(&state.pool, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Device {}", id)))?;
    Ok(Json(device))
}

/// POST /api/devices  (pre-provision an identity)
pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterDeviceRequest>,
) -> ApiResult<impl IntoResponse> {
    let device = state
        .identity()
        .issue_identity(&req.project_code, req.slot, &req.name, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

/// DELETE /api/devices/:id
pub async fn delete_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.identity().delete_device(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /api/devices/:id/revoke
pub async fn revoke_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.identity().revoke(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /api/devices/:id/reprovision
pub async fn reprovision_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.identity().reprovision(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
