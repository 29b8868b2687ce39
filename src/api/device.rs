//! Device-facing protocol routes.
//!
//! Every call authenticates first and refreshes liveness last, so a rejected
//! or failed call never counts as contact. An unbound identity's secret is
//! bound in that same final step: a call that fails for any reason binds
//! nothing. Queued commands are only handed to an identity that is already
//! bound.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    db,
    error::{ApiError, ApiResult},
    identity::VerifiedDevice,
    liveness::Contact,
    protocol::{
        CommandStatus, ConfigSnapshot, ConfirmRequest, ConfirmResponse, FetchConfigRequest,
        HeartbeatRequest, HeartbeatResponse, PollResponse, PushReadingsRequest,
        PushReadingsResponse, DEVICE_ID_HEADER, DEVICE_KEY_HEADER,
    },
    AppState,
};

/// Identity headers presented on every device call.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub key: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for DeviceCredentials
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        match (header(DEVICE_ID_HEADER), header(DEVICE_KEY_HEADER)) {
            (Some(device_id), Some(key)) => Ok(DeviceCredentials { device_id, key }),
            _ => Err(ApiError::AuthenticationFailed),
        }
    }
}

async fn authenticate(state: &AppState, creds: &DeviceCredentials) -> ApiResult<VerifiedDevice> {
    state
        .identity()
        .authenticate(&creds.device_id, &creds.key)
        .await
}

fn parse_status(status: &str) -> ApiResult<CommandStatus> {
    status
        .parse::<CommandStatus>()
        .map_err(|e| ApiError::Internal(e.into()))
}

/// POST /device/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    creds: DeviceCredentials,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let device = authenticate(&state, &creds).await?;
    if req.firmware_version.trim().is_empty() {
        return Err(ApiError::ValidationFailed("firmware_version is required".into()));
    }

    let now = Utc::now();
    let device_command = match device.pending_hash {
        None => state.commands().claim_device_command(device.id(), now).await?,
        Some(_) => None,
    };
    let config_version = state
        .liveness()
        .record_contact(&device, &Contact::from(&req), now)
        .await?;
    Ok(Json(HeartbeatResponse {
        config_version,
        timestamp: db::timestamp(now),
        device_command,
    }))
}

/// POST /device/config  (body optional; carries port announcements)
pub async fn fetch_config(
    State(state): State<Arc<AppState>>,
    creds: DeviceCredentials,
    body: Option<Json<FetchConfigRequest>>,
) -> ApiResult<Json<ConfigSnapshot>> {
    let device = authenticate(&state, &creds).await?;
    let announce = body.and_then(|Json(req)| req.announce);

    let now = Utc::now();
    let snapshot = state
        .config_sync()
        .fetch(device.id(), announce.as_ref(), now)
        .await?;
    state
        .liveness()
        .record_contact(&device, &Contact::default(), now)
        .await?;
    Ok(Json(snapshot))
}

/// POST /device/readings
pub async fn push_readings(
    State(state): State<Arc<AppState>>,
    creds: DeviceCredentials,
    Json(req): Json<PushReadingsRequest>,
) -> ApiResult<Json<PushReadingsResponse>> {
    let device = authenticate(&state, &creds).await?;

    let now = Utc::now();
    let inserted_count = state.telemetry().ingest(device.id(), &req.readings, now).await?;
    state
        .liveness()
        .record_contact(&device, &Contact::default(), now)
        .await?;
    Ok(Json(PushReadingsResponse { inserted_count }))
}

/// POST /device/commands/poll
pub async fn poll_commands(
    State(state): State<Arc<AppState>>,
    creds: DeviceCredentials,
) -> ApiResult<Json<PollResponse>> {
    let device = authenticate(&state, &creds).await?;

    let now = Utc::now();
    let commands = match device.pending_hash {
        None => state.commands().claim(device.id(), now).await?,
        Some(_) => Vec::new(),
    };
    state
        .liveness()
        .record_contact(&device, &Contact::default(), now)
        .await?;
    Ok(Json(PollResponse { commands }))
}

/// POST /device/commands/:id/confirm
pub async fn confirm_command(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
    creds: DeviceCredentials,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<Json<ConfirmResponse>> {
    let device = authenticate(&state, &creds).await?;

    let now = Utc::now();
    let command = state
        .commands()
        .confirm(
            device.id(),
            &command_id,
            req.outcome,
            req.error_message.as_deref(),
            now,
        )
        .await?;
    state
        .liveness()
        .record_contact(&device, &Contact::default(), now)
        .await?;
    Ok(Json(ConfirmResponse {
        ok: true,
        status: parse_status(&command.status)?,
    }))
}

/// POST /device/device-commands/:id/confirm
pub async fn confirm_device_command(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
    creds: DeviceCredentials,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<Json<ConfirmResponse>> {
    let device = authenticate(&state, &creds).await?;

    let now = Utc::now();
    let command = state
        .commands()
        .confirm_device_command(
            device.id(),
            &command_id,
            req.outcome,
            req.error_message.as_deref(),
            now,
        )
        .await?;
    state
        .liveness()
        .record_contact(&device, &Contact::default(), now)
        .await?;
    Ok(Json(ConfirmResponse {
        ok: true,
        status: parse_status(&command.status)?,
    }))
}
