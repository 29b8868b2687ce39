//! Auto-discovery of sensors and actuators from inline device metadata.
//!
//! Devices re-announce their ports on every reading batch and config fetch.
//! Registration is an upsert on (device, local id): a new port is inserted
//! active, a known one is refreshed and reactivated. Nothing here ever
//! deactivates a port; only operators do that.

use sqlx::SqliteConnection;

use crate::db::{
    models::{Actuator, Sensor},
    queries,
};
use crate::error::{ApiError, ApiResult};
use crate::protocol::{ActuatorAnnouncement, Announcement, SensorAnnouncement};

const MAX_LOCAL_ID_LEN: usize = 32;

pub fn validate_local_id(local_id: &str) -> ApiResult<()> {
    let trimmed = local_id.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_LOCAL_ID_LEN || trimmed != local_id {
        return Err(ApiError::ValidationFailed(format!(
            "invalid port identifier '{}'",
            local_id
        )));
    }
    Ok(())
}

fn validate_type(declared_type: &str) -> ApiResult<()> {
    if declared_type.trim().is_empty() {
        return Err(ApiError::ValidationFailed("declared type must not be empty".into()));
    }
    Ok(())
}

/// Outcome of registering one port.
#[derive(Debug, Clone)]
pub struct Registered<T> {
    pub record: T,
    /// True when the port was seen for the first time.
    pub discovered: bool,
}

pub async fn register_sensor(
    conn: &mut SqliteConnection,
    device_id: &str,
    sensor: &SensorAnnouncement,
    now: &str,
) -> ApiResult<Registered<Sensor>> {
    validate_local_id(&sensor.local_id)?;
    validate_type(&sensor.declared_type)?;

    let known = queries::find_sensor(&mut *conn, device_id, &sensor.local_id)
        .await?
        .is_some();
    let record = queries::upsert_sensor(
        conn,
        device_id,
        &sensor.local_id,
        &sensor.declared_type,
        sensor.unit.as_deref(),
        sensor.name.as_deref(),
        now,
    )
    .await?;
    let discovered = !known;
    if discovered {
        tracing::info!("Discovered sensor {} ({}) on {}", sensor.local_id, sensor.declared_type, device_id);
    }
    Ok(Registered { record, discovered })
}

pub async fn register_actuator(
    conn: &mut SqliteConnection,
    device_id: &str,
    actuator: &ActuatorAnnouncement,
    now: &str,
) -> ApiResult<Registered<Actuator>> {
    validate_local_id(&actuator.local_id)?;
    validate_type(&actuator.declared_type)?;

    let known = queries::find_actuator(&mut *conn, device_id, &actuator.local_id)
        .await?
        .is_some();
    let record = queries::upsert_actuator(
        conn,
        device_id,
        &actuator.local_id,
        &actuator.declared_type,
        actuator.supports_pwm,
        now,
    )
    .await?;
    let discovered = !known;
    if discovered {
        tracing::info!("Discovered actuator {} ({}) on {}", actuator.local_id, actuator.declared_type, device_id);
    }
    Ok(Registered { record, discovered })
}

/// Register everything in an announcement. Returns the newly discovered
/// `(local_id, kind)` pairs.
pub async fn register_announcement(
    conn: &mut SqliteConnection,
    device_id: &str,
    announcement: &Announcement,
    now: &str,
) -> ApiResult<Vec<(String, &'static str)>> {
    let mut discovered = Vec::new();
    for sensor in &announcement.sensors {
        if register_sensor(conn, device_id, sensor, now).await?.discovered {
            discovered.push((sensor.local_id.clone(), "sensor"));
        }
    }
    for actuator in &announcement.actuators {
        if register_actuator(conn, device_id, actuator, now).await?.discovered {
            discovered.push((actuator.local_id.clone(), "actuator"));
        }
    }
    Ok(discovered)
}
