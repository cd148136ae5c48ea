//! Process-wide registry of per-resource locks.
//!
//! Shared filesystem resources (a task's working directory, the environment
//! store file) are guarded by an async mutex looked up by absolute path.
//! The registry creates each lock lazily and hands out the same instance
//! for the life of the process; unrelated keys never contend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

/// Mutual-exclusion handle for one resource key.
pub type ResourceLock = Arc<tokio::sync::Mutex<()>>;

static GLOBAL: LazyLock<LockRegistry> = LazyLock::new(LockRegistry::new);

/// Map from resource path to its lock.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, ResourceLock>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every component in this process.
    pub fn global() -> &'static LockRegistry {
        &GLOBAL
    }

    /// Return the lock for `key`, creating it on first use.
    ///
    /// Relative keys are resolved against the current directory so that
    /// `ws/a` and `/abs/ws/a` name the same resource.
    pub fn get_lock(&self, key: impl AsRef<Path>) -> ResourceLock {
        let key = normalize_key(key.as_ref());
        // The map is only touched for insert/lookup and never held across an
        // await, so a poisoned guard still holds a consistent map.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shorthand for `LockRegistry::global().get_lock(key)`.
pub fn get_lock(key: impl AsRef<Path>) -> ResourceLock {
    LockRegistry::global().get_lock(key)
}

fn normalize_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
