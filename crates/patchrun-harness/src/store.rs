//! JSON-file key/value store guarded by a resource lock.
//!
//! Used to remember which environment belongs to which task. Every
//! operation holds the store's lock for the whole read-modify-write cycle,
//! so concurrent writers never lose updates. The store is a single file:
//! distinct keys still serialize through the same lock.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::HarnessError;
use crate::lock::{get_lock, ResourceLock};

/// Persisted string-to-string map in `<directory>/<name>.json`.
#[derive(Debug, Clone)]
pub struct LockedKvStore {
    path: PathBuf,
    lock: ResourceLock,
}

impl LockedKvStore {
    /// Open (lazily) the store named `name` inside `directory`.
    pub fn new(directory: impl AsRef<Path>, name: &str) -> Self {
        let path = directory.as_ref().join(format!("{name}.json"));
        let lock = get_lock(&path);
        Self { path, lock }
    }

    /// Backing file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value stored under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<String>, HarnessError> {
        let _guard = self.lock.lock().await;
        let mut data = self.load().await?;
        Ok(data.remove(key))
    }

    /// Insert or overwrite `key`.
    pub async fn put(&self, key: &str, value: &str) -> Result<(), HarnessError> {
        let _guard = self.lock.lock().await;
        let mut data = self.load().await?;
        data.insert(key.to_string(), value.to_string());
        self.save(&data).await?;
        debug!(store = %self.path.display(), key, value, "Store entry written");
        Ok(())
    }

    /// Delete `key`; returns false when it was not present.
    pub async fn remove(&self, key: &str) -> Result<bool, HarnessError> {
        let _guard = self.lock.lock().await;
        let mut data = self.load().await?;
        if data.remove(key).is_none() {
            return Ok(false);
        }
        self.save(&data).await?;
        debug!(store = %self.path.display(), key, "Store entry removed");
        Ok(true)
    }

    /// Snapshot of every entry.
    pub async fn entries(&self) -> Result<BTreeMap<String, String>, HarnessError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, HarnessError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, data: &BTreeMap<String, String>) -> Result<(), HarnessError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(data)?;
        // Write-then-rename keeps the previous contents intact if we crash
        // mid-write.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
