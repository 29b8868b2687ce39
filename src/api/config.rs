use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    config_sync::{ActuatorConfig, SensorConfig},
    db::queries,
    error::{ApiError, ApiResult},
    AppState,
};

const DEFAULT_READINGS_LIMIT: i64 = 100;
const MAX_READINGS_LIMIT: i64 = 1000;

#[derive(Deserialize)]
pub struct ReadingsQuery {
    pub limit: Option<i64>,
}

/// GET /api/devices/:id/config  (what the device would receive now)
pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state
        .config_sync()
        .fetch(&id, None, Utc::now())
        .await
        .map_err(|e| match e {
            ApiError::IdentityNotFound(id) => ApiError::NotFound(format!("Device {}", id)),
            other => other,
        })?;
    Ok(Json(snapshot))
}

/// GET /api/devices/:id/sensors
pub async fn list_sensors(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let sensors = queries::list_sensors(&state.pool, &id).await?;
    Ok(Json(serde_json::json!({ "sensors": sensors })))
}

/// PUT /api/devices/:id/sensors/:local_id
pub async fn put_sensor(
    State(state): State<Arc<AppState>>,
    Path((id, local_id)): Path<(String, String)>,
    Json(req): Json<SensorConfig>,
) -> ApiResult<impl IntoResponse> {
    let sensor = state
        .config_sync()
        .upsert_sensor(&id, &local_id, &req, Utc::now())
        .await?;
    Ok(Json(sensor))
}

/// DELETE /api/devices/:id/sensors/:local_id
pub async fn delete_sensor(
    State(state): State<Arc<AppState>>,
    Path((id, local_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.config_sync().remove_sensor(&id, &local_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /api/devices/:id/actuators
pub async fn list_actuators(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let actuators = queries::list_actuators(&state.pool, &id).await?;
    Ok(Json(serde_json::json!({ "actuators": actuators })))
}

/// PUT /api/devices/:id/actuators/:local_id
pub async fn put_actuator(
    State(state): State<Arc<AppState>>,
    Path((id, local_id)): Path<(String, String)>,
    Json(req): Json<ActuatorConfig>,
) -> ApiResult<impl IntoResponse> {
    let actuator = state
        .config_sync()
        .upsert_actuator(&id, &local_id, &req, Utc::now())
        .await?;
    Ok(Json(actuator))
}

/// DELETE /api/devices/:id/actuators/:local_id
pub async fn delete_actuator(
    State(state): State<Arc<AppState>>,
    Path((id, local_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.config_sync().remove_actuator(&id, &local_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /api/sensors/:sensor_id/readings?limit=N  (newest first)
pub async fn list_readings(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
    Query(query): Query<ReadingsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .clamp(1, MAX_READINGS_LIMIT);
    queries::get_sensor(&state.pool, &sensor_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Sensor {}", sensor_id)))?;
    let readings = queries::list_readings(&state.pool, &sensor_id, limit).await?;
    Ok(Json(serde_json::json!({ "readings": readings })))
}
