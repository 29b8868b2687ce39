//! Record persistence.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::error::AgentError;
use super::record::{seal, unseal, DeviceRecord};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<DeviceRecord>, AgentError>;

    /// Persist the whole record atomically.
    async fn save(&self, record: &DeviceRecord) -> Result<(), AgentError>;

    /// Erase everything (factory reset).
    async fn clear(&self) -> Result<(), AgentError>;
}

/// Record kept in a single file, replaced via a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn load(&self) -> Result<Option<DeviceRecord>, AgentError> {
        match fs::read(&self.path).await {
            Ok(bytes) => unseal(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, record: &DeviceRecord) -> Result<(), AgentError> {
        let bytes = seal(record)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        };
        write
            .await
            .map_err(|e| AgentError::Storage(format!("failed to write {}: {}", self.path.display(), e)))
    }

    async fn clear(&self) -> Result<(), AgentError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store holding sealed bytes, with switchable write failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sealed: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Replace the stored bytes verbatim, bypassing the checksum.
    pub fn put_raw(&self, bytes: Vec<u8>) {
        if let Ok(mut sealed) = self.sealed.lock() {
            *sealed = Some(bytes);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Vec<u8>>>, AgentError> {
        self.sealed
            .lock()
            .map_err(|_| AgentError::Storage("memory store poisoned".into()))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self) -> Result<Option<DeviceRecord>, AgentError> {
        let sealed = self.lock()?;
        sealed.as_deref().map(unseal).transpose()
    }

    async fn save(&self, record: &DeviceRecord) -> Result<(), AgentError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AgentError::Storage("write failed".into()));
        }
        let bytes = seal(record)?;
        *self.lock()? = Some(bytes);
        Ok(())
    }

    async fn clear(&self) -> Result<(), AgentError> {
        *self.lock()? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::record::WifiCredentials;

    fn record() -> DeviceRecord {
        DeviceRecord::provision(
            "P1-ESP1",
            WifiCredentials {
                ssid: "net".into(),
                password: String::new(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested").join("record.json"));
        assert!(store.load().await.unwrap().is_none());

        let r = record();
        store.save(&r).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(r));
        assert!(!store.path().with_extension("tmp").exists());

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("record.json"));
        store.save(&record()).await.unwrap();
        let mut bytes = std::fs::read(store.path()).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0x20;
        std::fs::write(store.path(), bytes).unwrap();
        assert!(matches!(store.load().await, Err(AgentError::StorageCorruption(_))));
    }
}
