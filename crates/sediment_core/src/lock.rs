//! Exclusive lock on a partition directory.
//!
//! Only one builder may write into a partition directory at a time. The lock
//! is an advisory `fs2` lock on a `LOCK` file at the partition root:
//!
//! ```text
//! <partition>/
//! ├─ LOCK           # held while a builder is open
//! ├─ version.<id>   # committed versions
//! └─ segment_<id>/  # segment directories
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the lock file inside a partition directory.
pub const LOCK_FILE: &str = "LOCK";

/// Holds the exclusive lock until dropped.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    file: File,
}

impl DirectoryLock {
    /// Acquires the lock of the partition rooted at `root`, creating the
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PartitionLocked`] if another holder has it.
    pub fn acquire(root: &Path) -> CoreResult<Self> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::PartitionLocked);
        }
        debug!(path = %path.display(), "acquired partition lock");
        Ok(Self { path, file })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_lock_is_rejected() {
        let dir = tempdir().unwrap();
        let first = DirectoryLock::acquire(dir.path()).unwrap();
        let err = DirectoryLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::PartitionLocked));

        drop(first);
        assert!(DirectoryLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let lock = DirectoryLock::acquire(&nested).unwrap();
        assert!(lock.path().exists());
    }
}
