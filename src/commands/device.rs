//! Device-level commands: restart and network change.
//!
//! One command is handed out per heartbeat, oldest first. The device reports
//! the outcome once it has acted; a `wifi_update` that could not join the new
//! network comes back `failed` with the device's reason.

use chrono::{DateTime, Utc};

use super::{check_repeated_outcome, truncate_message, CommandQueue};
use crate::db::{self, models::DeviceCommand, queries};
use crate::error::{ApiError, ApiResult};
use crate::protocol::{CommandOutcome, DeviceAction, PendingDeviceCommand};
use crate::ws::WsEvent;

const MAX_SSID_LEN: usize = 32;
const MAX_PASSWORD_LEN: usize = 63;

/// Reject actions the device could not store.
pub fn validate_action(action: &DeviceAction) -> ApiResult<()> {
    if let DeviceAction::WifiUpdate { ssid, password } = action {
        if ssid.trim().is_empty() || ssid.len() > MAX_SSID_LEN {
            return Err(ApiError::ValidationFailed(format!(
                "ssid must be 1-{} bytes",
                MAX_SSID_LEN
            )));
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(ApiError::ValidationFailed(format!(
                "password must be at most {} bytes",
                MAX_PASSWORD_LEN
            )));
        }
    }
    Ok(())
}

fn to_pending(command: DeviceCommand) -> ApiResult<PendingDeviceCommand> {
    let action = match (command.kind.as_str(), command.wifi_ssid) {
        ("reset", _) => DeviceAction::Reset,
        ("wifi_update", Some(ssid)) => DeviceAction::WifiUpdate {
            ssid,
            password: command.wifi_password.unwrap_or_default(),
        },
        (other, _) => {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "malformed device command {} ({})",
                command.id,
                other
            )))
        }
    };
    Ok(PendingDeviceCommand {
        command_id: command.id,
        action,
    })
}

impl CommandQueue {
    pub async fn enqueue_device_command(
        &self,
        device_id: &str,
        action: &DeviceAction,
        now: DateTime<Utc>,
    ) -> ApiResult<DeviceCommand> {
        validate_action(action)?;
        if queries::get_device(&self.pool, device_id).await?.is_none() {
            return Err(ApiError::NotFound(format!("Device {}", device_id)));
        }

        let wifi = match action {
            DeviceAction::Reset => None,
            DeviceAction::WifiUpdate { ssid, password } => {
                Some((ssid.trim().to_string(), password.clone()))
            }
        };
        let command = DeviceCommand::new(
            device_id.to_string(),
            action.kind(),
            wifi,
            now,
            self.expires_at(now),
        );
        queries::insert_device_command(&self.pool, &command).await?;

        tracing::info!("Queued {} for {} (command {})", command.kind, device_id, command.id);
        let _ = self.event_tx.send(WsEvent::DeviceCommandQueued {
            command_id: command.id.clone(),
            device_id: device_id.to_string(),
            kind: command.kind.clone(),
        });
        Ok(command)
    }

    /// Claim the oldest pending device command, if any.
    pub async fn claim_device_command(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> ApiResult<Option<PendingDeviceCommand>> {
        let Some(command) =
            queries::claim_device_command(&self.pool, device_id, &db::timestamp(now)).await?
        else {
            return Ok(None);
        };
        tracing::info!("Device {} claimed {} command {}", device_id, command.kind, command.id);
        let _ = self.event_tx.send(WsEvent::CommandRetrieved {
            command_id: command.id.clone(),
            device_id: device_id.to_string(),
        });
        to_pending(command).map(Some)
    }

    pub async fn confirm_device_command(
        &self,
        device_id: &str,
        command_id: &str,
        outcome: CommandOutcome,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResult<DeviceCommand> {
        let error_message = match outcome {
            CommandOutcome::Failed => error_message.map(truncate_message),
            CommandOutcome::Confirmed => None,
        };
        let target = outcome.status();

        let completed = queries::complete_device_command(
            &self.pool,
            command_id,
            device_id,
            target.as_str(),
            error_message.as_deref(),
            &db::timestamp(now),
        )
        .await?;

        let Some(command) = completed else {
            let command = queries::get_device_command(&self.pool, command_id)
                .await?
                .filter(|c| c.device_id == device_id)
                .ok_or_else(|| ApiError::NotFound(format!("Command {}", command_id)))?;
            check_repeated_outcome(command_id, &command.status, target)?;
            return Ok(command);
        };

        match outcome {
            CommandOutcome::Confirmed => {
                tracing::info!("{} {} confirmed by {}", command.kind, command_id, device_id)
            }
            CommandOutcome::Failed => tracing::warn!(
                "{} {} failed on {}: {}",
                command.kind,
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

    pub async fn list_device_commands(&self, device_id: &str) -> ApiResult<Vec<DeviceCommand>> {
        Ok(queries::list_device_commands(&self.pool, device_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Device;
    use chrono::Duration as ChronoDuration;
    use sqlx::SqlitePool;
    use std::time::Duration;
    use tokio::sync::broadcast;

    async fn queue() -> (CommandQueue, SqlitePool) {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let device = Device::new("P1".into(), 1, "Bench".into(), Utc::now());
        queries::insert_device(&pool, &device).await.unwrap();
        let (tx, _) = broadcast::channel(16);
        (CommandQueue::new(pool.clone(), tx, Duration::from_secs(300), 5), pool)
    }

    fn wifi(ssid: &str) -> DeviceAction {
        DeviceAction::WifiUpdate {
            ssid: ssid.into(),
            password: "hay".into(),
        }
    }

    #[test]
    fn wifi_update_needs_an_ssid() {
        assert!(validate_action(&DeviceAction::Reset).is_ok());
        assert!(validate_action(&wifi("barn")).is_ok());
        assert!(validate_action(&wifi("  ")).is_err());
        assert!(validate_action(&wifi(&"x".repeat(33))).is_err());
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let (q, _) = queue().await;
        let result = q.enqueue_device_command("P1-ESP9", &DeviceAction::Reset, Utc::now()).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn handed_out_one_at_a_time_oldest_first() {
        let (q, _) = queue().await;
        let t0 = Utc::now();
        let first = q.enqueue_device_command("P1-ESP1", &wifi("barn"), t0).await.unwrap();
        let second = q.enqueue_device_command("P1-ESP1", &DeviceAction::Reset, t0).await.unwrap();
        // The operator listing never shows the password
        let listed = serde_json::to_value(&first).unwrap();
        assert!(listed.get("wifi_password").is_none());

        let later = t0 + ChronoDuration::seconds(1);
        let a = q.claim_device_command("P1-ESP1", later).await.unwrap().unwrap();
        assert_eq!(a.command_id, first.id);
        assert_eq!(a.action, wifi("barn"));
        let b = q.claim_device_command("P1-ESP1", later).await.unwrap().unwrap();
        assert_eq!(b.command_id, second.id);
        assert!(q.claim_device_command("P1-ESP1", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_network_change_records_reason() {
        let (q, _) = queue().await;
        let now = Utc::now();
        let c = q.enqueue_device_command("P1-ESP1", &wifi("barn"), now).await.unwrap();
        q.claim_device_command("P1-ESP1", now).await.unwrap();

        let reason = "WiFi connection failed, restored backup";
        let failed = q
            .confirm_device_command("P1-ESP1", &c.id, CommandOutcome::Failed, Some(reason), now)
            .await
            .unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error_message.as_deref(), Some(reason));

        // Repeat is acknowledged, contradiction and foreign devices are not
        assert!(q
            .confirm_device_command("P1-ESP1", &c.id, CommandOutcome::Failed, Some(reason), now)
            .await
            .is_ok());
        assert!(matches!(
            q.confirm_device_command("P1-ESP1", &c.id, CommandOutcome::Confirmed, None, now).await,
            Err(ApiError::InvalidState(_))
        ));
        assert!(matches!(
            q.confirm_device_command("P1-ESP2", &c.id, CommandOutcome::Failed, None, now).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unclaimed_device_commands_expire() {
        let (q, pool) = queue().await;
        let t0 = Utc::now();
        let c = q.enqueue_device_command("P1-ESP1", &DeviceAction::Reset, t0).await.unwrap();
        let six_minutes = t0 + ChronoDuration::minutes(6);
        assert!(q.claim_device_command("P1-ESP1", six_minutes).await.unwrap().is_none());
        assert_eq!(q.expire(six_minutes).await.unwrap(), 1);
        let stored = queries::get_device_command(&pool, &c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "expired");
    }
}
