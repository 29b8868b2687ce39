//! Actuator command queue.
//!
//! Lifecycle: `pending -> retrieved -> confirmed | failed`, or
//! `pending -> expired` once the expiry passes unclaimed. A device receives a
//! command at most once: polling claims a batch with a single conditional
//! UPDATE that selects and marks rows together. Retrieved commands never
//! expire; the device must report an outcome. Failed and expired commands are
//! not retried; operators issue a new command instead.
//!
//! Device-level commands (see [`device`]) follow the same lifecycle but are
//! handed out one at a time with the heartbeat.

pub mod device;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::db::{self, models::Command, queries};
use crate::error::{ApiError, ApiResult};
use crate::protocol::{CommandKind, CommandOutcome, CommandStatus, PolledCommand};
use crate::ws::WsEvent;

pub const MAX_VALUE: i64 = 100;
const MAX_ERROR_MESSAGE_LEN: usize = 256;

/// Operator request to drive an actuator.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCommand {
    pub kind: CommandKind,
    #[serde(default)]
    pub value: Option<i64>,
}

impl NewCommand {
    /// `value` is present iff the kind is `set_value`, and within 0..=100.
    pub fn validate(&self) -> ApiResult<()> {
        match (self.kind, self.value) {
            (CommandKind::SetValue, None) => Err(ApiError::ValidationFailed(
                "set_value requires a value".into(),
            )),
            (CommandKind::SetValue, Some(v)) if !(0..=MAX_VALUE).contains(&v) => Err(
                ApiError::ValidationFailed(format!("value {} outside 0-{}", v, MAX_VALUE)),
            ),
            (CommandKind::On | CommandKind::Off, Some(_)) => Err(ApiError::ValidationFailed(
                format!("{} does not take a value", self.kind.as_str()),
            )),
            _ => Ok(()),
        }
    }
}

pub struct CommandQueue {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    expiry: Duration,
    batch_size: u32,
}

impl CommandQueue {
    pub fn new(
        pool: SqlitePool,
        event_tx: broadcast::Sender<WsEvent>,
        expiry: Duration,
        batch_size: u32,
    ) -> Self {
        CommandQueue {
            pool,
            event_tx,
            expiry,
            batch_size,
        }
    }

    /// Queue a command for an actuator. Validation happens before any write;
    /// the actuator's state is untouched until the device confirms.
    pub async fn enqueue(
        &self,
        device_id: &str,
        actuator_local_id: &str,
        request: &NewCommand,
        now: DateTime<Utc>,
    ) -> ApiResult<Command> {
        request.validate()?;

        let actuator = queries::find_actuator(&self.pool, device_id, actuator_local_id)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!("Actuator {} on {}", actuator_local_id, device_id))
            })?;
        if !actuator.is_active {
            return Err(ApiError::ValidationFailed(format!(
                "actuator {} is inactive",
                actuator_local_id
            )));
        }
        if request.kind == CommandKind::SetValue && !actuator.supports_pwm {
            return Err(ApiError::ValidationFailed(format!(
                "actuator {} does not support set_value",
                actuator_local_id
            )));
        }

        let command = Command::new(
            device_id.to_string(),
            actuator.id.clone(),
            request.kind.as_str(),
            request.value,
            now,
            self.expires_at(now),
        );
        queries::insert_command(&self.pool, &command).await?;

        tracing::info!(
            "Queued {} for {}/{} (command {})",
            command.kind,
            device_id,
            actuator_local_id,
            command.id
        );
        let _ = self.event_tx.send(WsEvent::CommandQueued {
            command_id: command.id.clone(),
            device_id: device_id.to_string(),
            actuator_local_id: actuator_local_id.to_string(),
            kind: command.kind.clone(),
        });
        Ok(command)
    }

    /// Atomically claim the device's oldest unexpired pending commands.
    pub async fn claim(&self, device_id: &str, now: DateTime<Utc>) -> ApiResult<Vec<PolledCommand>> {
        let claimed = queries::claim_pending_commands(
            &self.pool,
            device_id,
            &db::timestamp(now),
            i64::from(self.batch_size),
        )
        .await?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        // Read-only lookup after the claim has committed
        let local_ids: HashMap<String, String> = queries::list_actuators(&self.pool, device_id)
            .await?
            .into_iter()
            .map(|a| (a.id, a.local_id))
            .collect();

        let mut polled = Vec::with_capacity(claimed.len());
        for command in claimed {
            let kind = command
                .kind
                .parse::<CommandKind>()
                .map_err(|e| ApiError::Internal(e.into()))?;
            let _ = self.event_tx.send(WsEvent::CommandRetrieved {
                command_id: command.id.clone(),
                device_id: device_id.to_string(),
            });
            polled.push(PolledCommand {
                command_id: command.id,
                actuator_local_id: local_ids
                    .get(&command.actuator_id)
                    .cloned()
                    .unwrap_or_default(),
                kind,
                value: command.value,
            });
        }
        tracing::info!("Device {} claimed {} command(s)", device_id, polled.len());
        Ok(polled)
    }

    /// Record the device's outcome for a retrieved command.
    ///
    /// Repeating the outcome already recorded is acknowledged so that a
    /// retried confirmation is harmless.
    pub async fn confirm(
        &self,
        device_id: &str,
        command_id: &str,
        outcome: CommandOutcome,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResult<Command> {
        let error_message = match outcome {
            CommandOutcome::Failed => error_message.map(truncate_message),
            CommandOutcome::Confirmed => None,
        };
        let target = outcome.status();

        let mut tx = self.pool.begin().await?;
        let completed = queries::complete_command(
            &mut tx,
            command_id,
            device_id,
            target.as_str(),
            error_message.as_deref(),
            &db::timestamp(now),
        )
        .await?;

        let Some(command) = completed else {
            tx.rollback().await?;
            return self.explain_rejected_confirm(device_id, command_id, target).await;
        };

        if outcome == CommandOutcome::Confirmed {
            let kind = command
                .kind
                .parse::<CommandKind>()
                .map_err(|e| ApiError::Internal(e.into()))?;
            let (is_on, value) = match kind {
                CommandKind::On => (true, None),
                CommandKind::Off => (false, None),
                CommandKind::SetValue => {
                    let v = command.value.unwrap_or(0);
                    (v > 0, Some(v))
                }
            };
            queries::apply_actuator_state(&mut tx, &command.actuator_id, is_on, value).await?;
        }
        tx.commit().await?;

        match outcome {
            CommandOutcome::Confirmed => {
                tracing::info!("Command {} confirmed by {}", command_id, device_id)
            }
            CommandOutcome::Failed => tracing::warn!(
                "Command {} failed on {}: {}",
                command_id,
                device_id,
                command.error_message.as_deref().unwrap_or("no reason given")
            ),
        }
        let _ = self.event_tx.send(WsEvent::CommandCompleted {
            command_id: command.id.clone(),
            device_id: device_id.to_string(),
            status: command.status.clone(),
        });
        Ok(command)
    }

    async fn explain_rejected_confirm(
        &self,
        device_id: &str,
        command_id: &str,
        target: CommandStatus,
    ) -> ApiResult<Command> {
        let command = queries::get_command(&self.pool, command_id)
            .await?
            .filter(|c| c.device_id == device_id)
            .ok_or_else(|| ApiError::NotFound(format!("Command {}", command_id)))?;
        check_repeated_outcome(command_id, &command.status, target)?;
        Ok(command)
    }

    /// `pending -> expired` for everything past its expiry, actuator and
    /// device-level commands alike. Idempotent.
    pub async fn expire(&self, now: DateTime<Utc>) -> ApiResult<usize> {
        let now = db::timestamp(now);
        let expired: Vec<(String, String)> = queries::expire_pending_commands(&self.pool, &now)
            .await?
            .into_iter()
            .map(|c| (c.id, c.device_id))
            .chain(
                queries::expire_pending_device_commands(&self.pool, &now)
                    .await?
                    .into_iter()
                    .map(|c| (c.id, c.device_id)),
            )
            .collect();
        for (command_id, device_id) in &expired {
            tracing::info!("Command {} for {} expired unclaimed", command_id, device_id);
            let _ = self.event_tx.send(WsEvent::CommandExpired {
                command_id: command_id.clone(),
                device_id: device_id.clone(),
            });
        }
        Ok(expired.len())
    }

    fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::milliseconds(self.expiry.as_millis() as i64)
    }

    pub async fn list(&self, device_id: &str) -> ApiResult<Vec<Command>> {
        Ok(queries::list_commands(&self.pool, device_id).await?)
    }
}

fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}

/// A conditional completion matched nothing. Repeating the recorded outcome
/// is fine; anything else is a state error.
fn check_repeated_outcome(command_id: &str, status: &str, target: CommandStatus) -> ApiResult<()> {
    if status == target.as_str() {
        return Ok(());
    }
    Err(ApiError::InvalidState(format!(
        "command {} is {}, not retrieved",
        command_id, status
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_sync::{ActuatorConfig, ConfigSyncService};
    use crate::db::models::Device;

    async fn queue_with_pool(pool: SqlitePool) -> CommandQueue {
        let (tx, _) = broadcast::channel(64);
        let device = Device::new("P1".into(), 1, "Bench".into(), Utc::now());
        queries::insert_device(&pool, &device).await.unwrap();
        let config = ConfigSyncService::new(pool.clone(), tx.clone());
        for (port, pwm) in [("GPIO12", true), ("GPIO13", false)] {
            let actuator = ActuatorConfig {
                actuator_type: if pwm { "fan" } else { "valve" }.into(),
                supports_pwm: pwm,
                is_active: true,
            };
            config.upsert_actuator("P1-ESP1", port, &actuator, Utc::now()).await.unwrap();
        }
        CommandQueue::new(pool, tx, Duration::from_secs(300), 5)
    }

    async fn queue() -> CommandQueue {
        queue_with_pool(db::init_pool("sqlite::memory:").await.unwrap()).await
    }

    fn cmd(kind: CommandKind, value: Option<i64>) -> NewCommand {
        NewCommand { kind, value }
    }

    #[test]
    fn value_present_iff_set_value() {
        assert!(cmd(CommandKind::On, None).validate().is_ok());
        assert!(cmd(CommandKind::SetValue, Some(0)).validate().is_ok());
        assert!(cmd(CommandKind::SetValue, Some(100)).validate().is_ok());
        assert!(cmd(CommandKind::SetValue, None).validate().is_err());
        assert!(cmd(CommandKind::SetValue, Some(-1)).validate().is_err());
        assert!(cmd(CommandKind::Off, Some(10)).validate().is_err());
    }

    #[tokio::test]
    async fn out_of_range_value_is_rejected_before_write() {
        let q = queue().await;
        let result = q
            .enqueue("P1-ESP1", "GPIO12", &cmd(CommandKind::SetValue, Some(150)), Utc::now())
            .await;
        assert!(matches!(result, Err(ApiError::ValidationFailed(_))));
        assert!(q.list("P1-ESP1").await.unwrap().is_empty());

        let no_pwm = q
            .enqueue("P1-ESP1", "GPIO13", &cmd(CommandKind::SetValue, Some(50)), Utc::now())
            .await;
        assert!(matches!(no_pwm, Err(ApiError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn poll_claims_oldest_first_and_only_once() {
        let q = queue().await;
        let t0 = Utc::now();
        let first = q.enqueue("P1-ESP1", "GPIO12", &cmd(CommandKind::On, None), t0).await.unwrap();
        let second = q
            .enqueue(
                "P1-ESP1",
                "GPIO12",
                &cmd(CommandKind::SetValue, Some(40)),
                t0 + ChronoDuration::seconds(1),
            )
            .await
            .unwrap();

        let polled = q.claim("P1-ESP1", t0 + ChronoDuration::seconds(5)).await.unwrap();
        let ids: Vec<_> = polled.iter().map(|c| c.command_id.clone()).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(polled[0].actuator_local_id, "GPIO12");
        assert_eq!(polled[1].value, Some(40));

        let again = q.claim("P1-ESP1", t0 + ChronoDuration::seconds(6)).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn same_millisecond_commands_keep_queue_order() {
        let q = queue().await;
        let now = Utc::now();
        let mut queued = Vec::new();
        for kind in [CommandKind::On, CommandKind::Off, CommandKind::On, CommandKind::Off] {
            queued.push(q.enqueue("P1-ESP1", "GPIO13", &cmd(kind, None), now).await.unwrap().id);
        }
        let polled: Vec<_> = q
            .claim("P1-ESP1", now + ChronoDuration::seconds(1))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.command_id)
            .collect();
        assert_eq!(polled, queued);
    }

    #[tokio::test]
    async fn batch_size_caps_each_claim() {
        let q = queue().await;
        let t0 = Utc::now();
        for i in 0..7 {
            q.enqueue("P1-ESP1", "GPIO13", &cmd(CommandKind::Off, None), t0 + ChronoDuration::milliseconds(i))
                .await
                .unwrap();
        }
        assert_eq!(q.claim("P1-ESP1", t0 + ChronoDuration::seconds(1)).await.unwrap().len(), 5);
        assert_eq!(q.claim("P1-ESP1", t0 + ChronoDuration::seconds(1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicate_polls_claim_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let opts = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(dir.path().join("queue.db"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = db::connect(opts).await.unwrap();
        let q = queue_with_pool(pool).await;
        let now = Utc::now();
        q.enqueue("P1-ESP1", "GPIO12", &cmd(CommandKind::On, None), now).await.unwrap();

        let later = now + ChronoDuration::seconds(1);
        let (a, b) = tokio::join!(q.claim("P1-ESP1", later), q.claim("P1-ESP1", later));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.len() + b.len(), 1);
    }

    #[tokio::test]
    async fn confirm_updates_actuator_state_only_on_success() {
        let q = queue().await;
        let now = Utc::now();
        let c = q
            .enqueue("P1-ESP1", "GPIO12", &cmd(CommandKind::SetValue, Some(60)), now)
            .await
            .unwrap();
        let actuator = queries::find_actuator(&q.pool, "P1-ESP1", "GPIO12").await.unwrap().unwrap();
        assert!(!actuator.is_on);
        assert_eq!(actuator.current_value, None);

        // Cannot confirm before retrieval
        let early = q.confirm("P1-ESP1", &c.id, CommandOutcome::Confirmed, None, now).await;
        assert!(matches!(early, Err(ApiError::InvalidState(_))));

        q.claim("P1-ESP1", now).await.unwrap();
        let done = q.confirm("P1-ESP1", &c.id, CommandOutcome::Confirmed, None, now).await.unwrap();
        assert_eq!(done.status, "confirmed");
        let actuator = queries::find_actuator(&q.pool, "P1-ESP1", "GPIO12").await.unwrap().unwrap();
        assert!(actuator.is_on);
        assert_eq!(actuator.current_value, Some(60));

        // Retried confirmation is acknowledged, a contradicting one is not
        assert!(q.confirm("P1-ESP1", &c.id, CommandOutcome::Confirmed, None, now).await.is_ok());
        assert!(matches!(
            q.confirm("P1-ESP1", &c.id, CommandOutcome::Failed, None, now).await,
            Err(ApiError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn failure_keeps_actuator_state_and_records_reason() {
        let q = queue().await;
        let now = Utc::now();
        let c = q.enqueue("P1-ESP1", "GPIO13", &cmd(CommandKind::On, None), now).await.unwrap();
        q.claim("P1-ESP1", now).await.unwrap();
        let failed = q
            .confirm("P1-ESP1", &c.id, CommandOutcome::Failed, Some("relay stuck"), now)
            .await
            .unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error_message.as_deref(), Some("relay stuck"));
        let actuator = queries::find_actuator(&q.pool, "P1-ESP1", "GPIO13").await.unwrap().unwrap();
        assert!(!actuator.is_on);
    }

    #[tokio::test]
    async fn other_devices_cannot_confirm() {
        let q = queue().await;
        let now = Utc::now();
        let c = q.enqueue("P1-ESP1", "GPIO13", &cmd(CommandKind::Off, None), now).await.unwrap();
        q.claim("P1-ESP1", now).await.unwrap();
        let result = q.confirm("P1-ESP2", &c.id, CommandOutcome::Confirmed, None, now).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn stale_pending_commands_expire_and_are_never_polled() {
        let q = queue().await;
        let t0 = Utc::now();
        let stale = q.enqueue("P1-ESP1", "GPIO12", &cmd(CommandKind::On, None), t0).await.unwrap();
        let claimed = q.enqueue("P1-ESP1", "GPIO13", &cmd(CommandKind::On, None), t0).await.unwrap();
        // Mark only the second as already handed out
        sqlx::query("UPDATE commands SET status = 'retrieved' WHERE id = ?")
            .bind(&claimed.id)
            .execute(&q.pool)
            .await
            .unwrap();

        let six_minutes = t0 + ChronoDuration::minutes(6);
        // An unswept stale command is still never handed out
        assert!(q.claim("P1-ESP1", six_minutes).await.unwrap().is_empty());

        assert_eq!(q.expire(six_minutes).await.unwrap(), 1);
        assert_eq!(q.expire(six_minutes).await.unwrap(), 0);

        let stale = queries::get_command(&q.pool, &stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, "expired");
        let claimed = queries::get_command(&q.pool, &claimed.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, "retrieved");
        assert!(q.claim("P1-ESP1", six_minutes).await.unwrap().is_empty());
    }
}
