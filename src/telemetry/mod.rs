//! Sensor reading ingestion.
//!
//! A batch is all-or-nothing: every reading is validated first, then sensors
//! are registered and readings inserted inside one transaction.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::db::{self, queries};
use crate::discovery;
use crate::error::{ApiError, ApiResult};
use crate::protocol::{ReadingPayload, SensorAnnouncement};
use crate::ws::WsEvent;

const MAX_BATCH: usize = 64;

pub struct TelemetryService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
}

impl TelemetryService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        TelemetryService { pool, event_tx }
    }

    /// Store a batch of readings. Returns how many rows were inserted.
    pub async fn ingest(
        &self,
        device_id: &str,
        readings: &[ReadingPayload],
        now: DateTime<Utc>,
    ) -> ApiResult<usize> {
        if readings.len() > MAX_BATCH {
            return Err(ApiError::ValidationFailed(format!(
                "at most {} readings per batch",
                MAX_BATCH
            )));
        }
        for reading in readings {
            validate_reading(reading)?;
        }
        if readings.is_empty() {
            return Ok(0);
        }

        let recorded_at = db::timestamp(now);
        let mut discovered = Vec::new();
        let mut tx = self.pool.begin().await?;
        for reading in readings {
            let announcement = SensorAnnouncement {
                local_id: reading.local_sensor_id.clone(),
                declared_type: reading.declared_type.clone(),
                unit: reading.unit.clone(),
                name: None,
            };
            let registered =
                discovery::register_sensor(&mut tx, device_id, &announcement, &recorded_at).await?;
            if registered.discovered {
                discovered.push(reading.local_sensor_id.clone());
            }
            queries::insert_reading(
                &mut tx,
                &registered.record.id,
                reading.value,
                reading.unit.as_deref(),
                &recorded_at,
            )
            .await?;
        }
        tx.commit().await?;

        for local_id in discovered {
            let _ = self.event_tx.send(WsEvent::PortDiscovered {
                device_id: device_id.to_string(),
                local_id,
                kind: "sensor".into(),
            });
        }
        tracing::debug!("Stored {} reading(s) from {}", readings.len(), device_id);
        Ok(readings.len())
    }
}

fn validate_reading(reading: &ReadingPayload) -> ApiResult<()> {
    discovery::validate_local_id(&reading.local_sensor_id)?;
    if reading.declared_type.trim().is_empty() {
        return Err(ApiError::ValidationFailed(format!(
            "reading for {} has no declared type",
            reading.local_sensor_id
        )));
    }
    if !reading.value.is_finite() {
        return Err(ApiError::ValidationFailed(format!(
            "reading for {} is not a finite number",
            reading.local_sensor_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Device;

    async fn service() -> TelemetryService {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let device = Device::new("P1".into(), 1, "Bench".into(), Utc::now());
        queries::insert_device(&pool, &device).await.unwrap();
        let (tx, _) = broadcast::channel(16);
        TelemetryService::new(pool, tx)
    }

    fn reading(local_id: &str, value: f64) -> ReadingPayload {
        ReadingPayload {
            local_sensor_id: local_id.into(),
            declared_type: "temperature".into(),
            value,
            unit: Some("C".into()),
        }
    }

    #[tokio::test]
    async fn readings_register_their_sensors() {
        let svc = service().await;
        let count = svc
            .ingest("P1-ESP1", &[reading("GPIO4", 21.5), reading("GPIO5", 19.0)], Utc::now())
            .await
            .unwrap();
        assert_eq!(count, 2);

        let sensors = queries::list_sensors(&svc.pool, "P1-ESP1").await.unwrap();
        assert_eq!(sensors.len(), 2);
        let readings = queries::list_readings(&svc.pool, &sensors[0].id, 10).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 21.5);

        svc.ingest("P1-ESP1", &[reading("GPIO4", 22.0)], Utc::now()).await.unwrap();
        assert_eq!(queries::list_sensors(&svc.pool, "P1-ESP1").await.unwrap().len(), 2);
        assert_eq!(queries::get_config_version(&svc.pool, "P1-ESP1").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn one_bad_reading_rejects_the_batch() {
        let svc = service().await;
        let result = svc
            .ingest("P1-ESP1", &[reading("GPIO4", 21.5), reading("GPIO5", f64::NAN)], Utc::now())
            .await;
        assert!(matches!(result, Err(ApiError::ValidationFailed(_))));
        assert!(queries::list_sensors(&svc.pool, "P1-ESP1").await.unwrap().is_empty());
    }
}
