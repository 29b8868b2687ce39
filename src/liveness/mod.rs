//! Connection-status state machine.
//!
//! ```text
//!   offline ──contact──▶ online ──silence > window──▶ offline
//!      │                   ▲
//!      └─never contacted,──┘ contact
//!        30s..5min after registration
//!              ▼
//!      connection_failed
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::db::{self, queries};
use crate::error::{ApiError, ApiResult};
use crate::identity::{self, VerifiedDevice};
use crate::protocol::HeartbeatRequest;
use crate::ws::WsEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Offline,
    Online,
    ConnectionFailed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Online => "online",
            ConnectionStatus::ConnectionFailed => "connection_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "offline" => Some(ConnectionStatus::Offline),
            "online" => Some(ConnectionStatus::Online),
            "connection_failed" => Some(ConnectionStatus::ConnectionFailed),
            _ => None,
        }
    }
}

/// Metadata a device may attach to a contact. Empty for non-heartbeat calls.
#[derive(Debug, Clone, Default)]
pub struct Contact {
    pub firmware_version: Option<String>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub rssi: Option<i64>,
}

impl From<&HeartbeatRequest> for Contact {
    fn from(req: &HeartbeatRequest) -> Self {
        let non_empty = |s: &Option<String>| s.as_ref().filter(|v| !v.trim().is_empty()).cloned();
        Contact {
            firmware_version: Some(req.firmware_version.trim().to_string())
                .filter(|v| !v.is_empty()),
            hostname: non_empty(&req.hostname),
            ip_address: non_empty(&req.ip_address),
            rssi: req.rssi,
        }
    }
}

/// Device ids moved by one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub demoted: Vec<String>,
    pub failed_joins: Vec<String>,
}

pub struct LivenessTracker {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    window: Duration,
    join_grace: Duration,
}

impl LivenessTracker {
    pub fn new(
        pool: SqlitePool,
        event_tx: broadcast::Sender<WsEvent>,
        window: Duration,
        join_grace: Duration,
    ) -> Self {
        LivenessTracker {
            pool,
            event_tx,
            window,
            join_grace,
        }
    }

    /// Record a successful authenticated contact and return the device's
    /// current config version. Must be the last step of a device call.
    ///
    /// A pending first-contact binding is written in the same transaction, so
    /// the secret is bound exactly when the contact counts.
    pub async fn record_contact(
        &self,
        verified: &VerifiedDevice,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> ApiResult<i64> {
        let device = &verified.device;
        let mut tx = self.pool.begin().await?;
        let bound = identity::bind_pending(&mut tx, verified).await?;
        let version = queries::record_contact(
            &mut *tx,
            &device.id,
            &db::timestamp(now),
            contact.firmware_version.as_deref(),
            contact.hostname.as_deref(),
            contact.ip_address.as_deref(),
            contact.rssi,
        )
        .await?
        .ok_or_else(|| ApiError::IdentityNotFound(device.id.clone()))?;
        tx.commit().await?;

        if bound {
            let _ = self.event_tx.send(WsEvent::SecretBound {
                device_id: device.id.clone(),
            });
        }
        if ConnectionStatus::parse(&device.status) != Some(ConnectionStatus::Online) {
            tracing::info!("Device {} is online (was {})", device.id, device.status);
            let _ = self.event_tx.send(WsEvent::DeviceStatusChanged {
                device_id: device.id.clone(),
                status: ConnectionStatus::Online.as_str().into(),
            });
        }
        Ok(version)
    }

    /// One idempotent pass of the status sweep. Each transition is a single
    /// conditional UPDATE, so overlapping or skipped runs are harmless.
    pub async fn sweep(&self, now: DateTime<Utc>) -> ApiResult<SweepReport> {
        let window = to_chrono(self.window);
        let grace = to_chrono(self.join_grace);

        let demoted =
            queries::demote_stale_devices(&self.pool, &db::timestamp(now - window)).await?;
        let failed_joins = queries::flag_failed_joins(
            &self.pool,
            &db::timestamp(now - window),
            &db::timestamp(now - grace),
        )
        .await?;

        for id in &demoted {
            tracing::info!("Device {} went offline (no contact within {:?})", id, self.window);
            let _ = self.event_tx.send(WsEvent::DeviceStatusChanged {
                device_id: id.clone(),
                status: ConnectionStatus::Offline.as_str().into(),
            });
        }
        for id in &failed_joins {
            tracing::warn!("Device {} never connected after registration", id);
            let _ = self.event_tx.send(WsEvent::DeviceStatusChanged {
                device_id: id.clone(),
                status: ConnectionStatus::ConnectionFailed.as_str().into(),
            });
        }

        Ok(SweepReport {
            demoted,
            failed_joins,
        })
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}
