//! Pull-based config synchronization.

use super::client::{DeviceApi, Identity};
use super::error::AgentError;
use super::record::DeviceRecord;
use super::store::RecordStore;
use crate::protocol::FetchConfigRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    Applied { from: i64, to: i64 },
}

/// Fetch and apply the full snapshot when the server is ahead of the cache.
///
/// The new record is persisted before it replaces `record`; if the save
/// fails, `record` and its cached version are untouched and the next
/// heartbeat retries.
pub async fn sync_config<A, S>(
    api: &A,
    store: &S,
    identity: &Identity,
    record: &mut DeviceRecord,
    server_version: i64,
) -> Result<SyncOutcome, AgentError>
where
    A: DeviceApi + ?Sized,
    S: RecordStore + ?Sized,
{
    if server_version <= record.config_version {
        return Ok(SyncOutcome::UpToDate);
    }

    tracing::info!(
        "Config changed on server (v{} > v{}); fetching",
        server_version,
        record.config_version
    );
    let snapshot = api
        .fetch_config(identity, &FetchConfigRequest::default())
        .await?;
    let updated = record.with_snapshot(&snapshot);
    store.save(&updated).await?;

    let from = record.config_version;
    *record = updated;
    tracing::info!(
        "Applied config v{}: {} sensor(s), {} actuator(s)",
        record.config_version,
        record.sensors.len(),
        record.actuators.len()
    );
    Ok(SyncOutcome::Applied {
        from,
        to: record.config_version,
    })
}
