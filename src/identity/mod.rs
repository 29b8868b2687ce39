//! Device identity issuance and trust-on-first-contact secret binding.
//!
//! A device is registered by an operator before it exists physically, so it
//! cannot be pre-loaded with a credential. The device generates its own secret
//! and the first successful contact binds its SHA-256 digest. A call that is
//! rejected for any reason binds nothing. Later contacts must present a secret
//! with the same digest.
//!
//! If two devices are configured with the same composite id, whichever reaches
//! the server first wins the binding and the other is locked out until an
//! operator reprovisions the identity. This is a first-contact race, not a
//! defense against an attacker who observes the composite id on the network.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::broadcast;

use crate::db::{models::Device, queries};
use crate::error::{ApiError, ApiResult};
use crate::utils::sha256_hex;
use crate::ws::WsEvent;

pub const MAX_SLOT: i64 = 99;
const MAX_PROJECT_LEN: usize = 8;

/// One-way digest stored in place of the device secret.
pub fn hash_secret(secret: &str) -> String {
    sha256_hex(secret.as_bytes())
}

/// A device whose presented secret checked out.
#[derive(Debug, Clone)]
pub struct VerifiedDevice {
    pub device: Device,
    /// Digest to bind when the identity had none yet.
    pub pending_hash: Option<String>,
}

impl VerifiedDevice {
    pub fn id(&self) -> &str {
        &self.device.id
    }
}

/// Write a pending first-contact binding inside the caller's transaction.
///
/// Returns true when this call bound the secret. If another contact bound a
/// different secret first, or the identity was revoked meanwhile, the caller
/// is rejected and must roll back.
pub async fn bind_pending(conn: &mut SqliteConnection, verified: &VerifiedDevice) -> ApiResult<bool> {
    let Some(pending) = verified.pending_hash.as_deref() else {
        return Ok(false);
    };
    let id = verified.id();
    if queries::bind_secret_hash(&mut *conn, id, pending).await? {
        tracing::info!("Bound device secret for {} on first contact", id);
        return Ok(true);
    }

    // Lost a concurrent binding race; compare against the winner.
    let current = queries::get_device(&mut *conn, id)
        .await?
        .ok_or_else(|| ApiError::IdentityNotFound(id.to_string()))?;
    match current.secret_hash.as_deref() {
        Some(stored) if !current.revoked && stored == pending => Ok(false),
        _ => {
            tracing::warn!("Rejected contact from {}: lost first-contact binding", id);
            Err(ApiError::AuthenticationFailed)
        }
    }
}

/// Normalize and validate a project code (uppercased ASCII alphanumerics).
pub fn normalize_project(project: &str) -> ApiResult<String> {
    let code = project.trim().to_ascii_uppercase();
    if code.is_empty() || code.len() > MAX_PROJECT_LEN {
        return Err(ApiError::ValidationFailed(format!(
            "project code must be 1-{} characters",
            MAX_PROJECT_LEN
        )));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ApiError::ValidationFailed(
            "project code must be alphanumeric".into(),
        ));
    }
    Ok(code)
}

pub fn validate_slot(slot: i64) -> ApiResult<()> {
    if !(1..=MAX_SLOT).contains(&slot) {
        return Err(ApiError::ValidationFailed(format!(
            "slot {} out of range 1-{}",
            slot, MAX_SLOT
        )));
    }
    Ok(())
}

/// Identity service: registration, authentication, revocation
pub struct IdentityService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
}

impl IdentityService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        IdentityService { pool, event_tx }
    }

    /// Pre-provision a device identity. The secret stays unbound until first contact.
    pub async fn issue_identity(
        &self,
        project: &str,
        slot: i64,
        name: &str,
        now: DateTime<Utc>,
    ) -> ApiResult<Device> {
        let project_code = normalize_project(project)?;
        validate_slot(slot)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::ValidationFailed("name must not be empty".into()));
        }

        let device = Device::new(project_code, slot, name.to_string(), now);
        if !queries::insert_device(&self.pool, &device).await? {
            return Err(ApiError::Conflict(format!(
                "slot {} is already registered under project {}",
                slot, device.project_code
            )));
        }

        tracing::info!("Registered device identity {}", device.id);
        let _ = self.event_tx.send(WsEvent::DeviceRegistered {
            device_id: device.id.clone(),
            name: device.name.clone(),
        });
        Ok(device)
    }

    /// Verify a presented secret without writing anything.
    ///
    /// An unbound identity accepts any non-empty secret; its digest is carried
    /// in [`VerifiedDevice::pending_hash`] and only written by [`bind_pending`]
    /// once the call has succeeded.
    pub async fn authenticate(&self, composite_id: &str, secret: &str) -> ApiResult<VerifiedDevice> {
        let device = queries::get_device(&self.pool, composite_id)
            .await?
            .ok_or_else(|| ApiError::IdentityNotFound(composite_id.to_string()))?;

        if secret.is_empty() || device.revoked {
            tracing::warn!("Rejected contact from {}: missing secret or revoked", composite_id);
            return Err(ApiError::AuthenticationFailed);
        }

        let presented = hash_secret(secret);
        match device.secret_hash.as_deref() {
            None => Ok(VerifiedDevice {
                device,
                pending_hash: Some(presented),
            }),
            Some(stored) if stored == presented => Ok(VerifiedDevice {
                device,
                pending_hash: None,
            }),
            Some(_) => {
                tracing::warn!("Rejected contact from {}: secret mismatch", composite_id);
                Err(ApiError::AuthenticationFailed)
            }
        }
    }

    /// Clear the bound hash and refuse all future authentication.
    pub async fn revoke(&self, composite_id: &str) -> ApiResult<()> {
        if !queries::revoke_device(&self.pool, composite_id).await? {
            return Err(ApiError::NotFound(format!("Device {}", composite_id)));
        }
        tracing::info!("Revoked device {}", composite_id);
        let _ = self.event_tx.send(WsEvent::DeviceRevoked {
            device_id: composite_id.to_string(),
        });
        Ok(())
    }

    /// Clear the binding so the next contact binds a fresh secret.
    ///
    /// Manual recovery after a device was factory-reset or lost the
    /// first-contact race.
    pub async fn reprovision(&self, composite_id: &str) -> ApiResult<()> {
        if !queries::reprovision_device(&self.pool, composite_id).await? {
            return Err(ApiError::NotFound(format!("Device {}", composite_id)));
        }
        tracing::info!("Reprovisioned device {}; awaiting first contact", composite_id);
        let _ = self.event_tx.send(WsEvent::DeviceReprovisioned {
            device_id: composite_id.to_string(),
        });
        Ok(())
    }

    /// Revoke, then delete the device and everything it owns.
    pub async fn delete_device(&self, composite_id: &str) -> ApiResult<()> {
        self.revoke(composite_id).await?;
        queries::delete_device(&self.pool, composite_id).await?;
        let _ = self.event_tx.send(WsEvent::DeviceDeleted {
            device_id: composite_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn service() -> IdentityService {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let (tx, _) = broadcast::channel(16);
        IdentityService::new(pool, tx)
    }

    /// Authenticate and commit the binding, as a successful device call does.
    async fn contact(svc: &IdentityService, id: &str, secret: &str) -> ApiResult<VerifiedDevice> {
        let verified = svc.authenticate(id, secret).await?;
        let mut tx = svc.pool.begin().await?;
        bind_pending(&mut tx, &verified).await?;
        tx.commit().await?;
        Ok(verified)
    }

    async fn stored_hash(svc: &IdentityService, id: &str) -> Option<String> {
        queries::get_device(&svc.pool, id).await.unwrap().unwrap().secret_hash
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            hash_secret("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn project_codes_are_normalized() {
        assert_eq!(normalize_project(" proj1 ").unwrap(), "PROJ1");
        assert!(normalize_project("").is_err());
        assert!(normalize_project("PROJ-1").is_err());
        assert!(normalize_project("WAYTOOLONG").is_err());
    }

    #[tokio::test]
    async fn issue_rejects_duplicate_and_out_of_range_slots() {
        let svc = service().await;
        let device = svc.issue_identity("proj1", 5, "Bench", Utc::now()).await.unwrap();
        assert_eq!(device.id, "PROJ1-ESP5");
        assert!(device.secret_hash.is_none());

        let dup = svc.issue_identity("PROJ1", 5, "Other", Utc::now()).await;
        assert!(matches!(dup, Err(ApiError::Conflict(_))));

        let bad = svc.issue_identity("PROJ1", 100, "Nope", Utc::now()).await;
        assert!(matches!(bad, Err(ApiError::ValidationFailed(_))));
        let bad = svc.issue_identity("PROJ1", 0, "Nope", Utc::now()).await;
        assert!(matches!(bad, Err(ApiError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn authenticate_alone_binds_nothing() {
        let svc = service().await;
        svc.issue_identity("PROJ1", 1, "Greenhouse", Utc::now()).await.unwrap();

        let verified = svc.authenticate("PROJ1-ESP1", "first-secret").await.unwrap();
        assert_eq!(verified.pending_hash, Some(hash_secret("first-secret")));
        assert_eq!(stored_hash(&svc, "PROJ1-ESP1").await, None);

        // Without a committed binding another secret is still accepted
        assert!(svc.authenticate("PROJ1-ESP1", "second-secret").await.is_ok());
    }

    #[tokio::test]
    async fn first_contact_binds_and_binding_is_write_once() {
        let svc = service().await;
        svc.issue_identity("PROJ1", 1, "Greenhouse", Utc::now()).await.unwrap();

        contact(&svc, "PROJ1-ESP1", "first-secret").await.unwrap();
        assert_eq!(stored_hash(&svc, "PROJ1-ESP1").await, Some(hash_secret("first-secret")));

        let other = contact(&svc, "PROJ1-ESP1", "second-secret").await;
        assert!(matches!(other, Err(ApiError::AuthenticationFailed)));
        assert_eq!(stored_hash(&svc, "PROJ1-ESP1").await, Some(hash_secret("first-secret")));

        let again = contact(&svc, "PROJ1-ESP1", "first-secret").await.unwrap();
        assert!(again.pending_hash.is_none());
    }

    #[tokio::test]
    async fn stale_pending_binding_loses_to_committed_one() {
        let svc = service().await;
        svc.issue_identity("PROJ1", 4, "Race", Utc::now()).await.unwrap();

        let slow = svc.authenticate("PROJ1-ESP4", "slow").await.unwrap();
        contact(&svc, "PROJ1-ESP4", "fast").await.unwrap();

        let mut tx = svc.pool.begin().await.unwrap();
        let lost = bind_pending(&mut tx, &slow).await;
        assert!(matches!(lost, Err(ApiError::AuthenticationFailed)));
        drop(tx);
        assert_eq!(stored_hash(&svc, "PROJ1-ESP4").await, Some(hash_secret("fast")));
    }

    #[tokio::test]
    async fn racing_first_contacts_bind_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let opts = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(dir.path().join("identity.db"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = db::connect(opts).await.unwrap();
        let (tx, _) = broadcast::channel(16);
        let svc = IdentityService::new(pool, tx);
        svc.issue_identity("PROJ1", 6, "Twin", Utc::now()).await.unwrap();

        let (a, b) = tokio::join!(
            contact(&svc, "PROJ1-ESP6", "secret-a"),
            contact(&svc, "PROJ1-ESP6", "secret-b")
        );
        let winner = match (a, b) {
            (Ok(_), Err(ApiError::AuthenticationFailed)) => "secret-a",
            (Err(ApiError::AuthenticationFailed), Ok(_)) => "secret-b",
            other => panic!("expected exactly one binding, got {:?}", other),
        };
        assert_eq!(stored_hash(&svc, "PROJ1-ESP6").await, Some(hash_secret(winner)));
        assert!(contact(&svc, "PROJ1-ESP6", winner).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_identity_creates_nothing() {
        let svc = service().await;
        let result = svc.authenticate("GHOST-ESP9", "whatever").await;
        assert!(matches!(result, Err(ApiError::IdentityNotFound(_))));
        assert!(queries::list_devices(&svc.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoke_blocks_and_reprovision_rebinds() {
        let svc = service().await;
        svc.issue_identity("PROJ1", 2, "Tunnel", Utc::now()).await.unwrap();
        contact(&svc, "PROJ1-ESP2", "old").await.unwrap();

        svc.revoke("PROJ1-ESP2").await.unwrap();
        assert!(matches!(
            svc.authenticate("PROJ1-ESP2", "old").await,
            Err(ApiError::AuthenticationFailed)
        ));
        assert!(matches!(
            svc.authenticate("PROJ1-ESP2", "new").await,
            Err(ApiError::AuthenticationFailed)
        ));

        svc.reprovision("PROJ1-ESP2").await.unwrap();
        contact(&svc, "PROJ1-ESP2", "new").await.unwrap();
        assert!(svc.authenticate("PROJ1-ESP2", "old").await.is_err());
    }

    #[tokio::test]
    async fn empty_secret_is_rejected_without_binding() {
        let svc = service().await;
        svc.issue_identity("PROJ1", 3, "Shed", Utc::now()).await.unwrap();
        assert!(matches!(
            svc.authenticate("PROJ1-ESP3", "").await,
            Err(ApiError::AuthenticationFailed)
        ));
        let stored = queries::get_device(&svc.pool, "PROJ1-ESP3").await.unwrap().unwrap();
        assert!(!stored.is_bound());
    }
}
