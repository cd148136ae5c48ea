//! Locked per-task working directories.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::HarnessError;
use crate::lock::get_lock;

/// Exclusive hold on a working directory.
///
/// At most one holder exists per path at a time. Dropping the guard
/// releases the lock; call [`release`](Self::release) to also remove the
/// directory asynchronously. If the guard is dropped without `release`
/// (panic or cancellation) the directory is removed synchronously so a
/// non-persistent evaluation never leaves state behind.
#[derive(Debug)]
pub struct LockedWorkDir {
    path: PathBuf,
    persist: bool,
    released: bool,
    // Dropped after `Drop::drop` runs, so removal happens while still locked.
    _guard: OwnedMutexGuard<()>,
}

impl LockedWorkDir {
    /// Wait for exclusive access to `path` and make sure it exists.
    pub async fn acquire(path: impl Into<PathBuf>, persist: bool) -> Result<Self, HarnessError> {
        let path = path.into();
        let guard = get_lock(&path).lock_owned().await;
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), persist, "Working directory acquired");
        Ok(Self {
            path,
            persist,
            released: false,
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist(&self) -> bool {
        self.persist
    }

    /// Remove the directory (unless persisting) and give up the lock.
    pub async fn release(mut self) -> Result<(), HarnessError> {
        self.released = true;
        if self.persist {
            debug!(path = %self.path.display(), "Working directory kept");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Working directory removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockedWorkDir {
    fn drop(&mut self) {
        if self.released || self.persist {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove working directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("task-1");

        let dir = LockedWorkDir::acquire(&path, false).await.unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        dir.release().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_persist_keeps_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("task-1");

        let dir = LockedWorkDir::acquire(&path, true).await.unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        dir.release().await.unwrap();

        assert!(path.join("file.txt").exists());
    }

    #[tokio::test]
    async fn test_drop_without_release_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("task-1");
        {
            let _dir = LockedWorkDir::acquire(&path, false).await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());

        // Lock was released with the guard.
        let again = tokio::time::timeout(
            Duration::from_secs(1),
            LockedWorkDir::acquire(&path, false),
        )
        .await
        .expect("lock should be free")
        .unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_holder_waits() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("task-1");

        let first = LockedWorkDir::acquire(&path, true).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), LockedWorkDir::acquire(&path, true))
                .await;
        assert!(blocked.is_err());

        first.release().await.unwrap();
        let second = LockedWorkDir::acquire(&path, true).await.unwrap();
        second.release().await.unwrap();
    }
}
