//! File-system directory for persistent storage.

use crate::directory::Directory;
use crate::error::{StorageError, StorageResult};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// A directory backed by the local file system.
///
/// Blob names map to paths below the root. Data survives process restarts.
///
/// # Durability
///
/// - `store` and `append` call `File::sync_all()` before returning
/// - `commit` writes a uniquely named temporary file, syncs it, renames it
///   over the target and then fsyncs the parent directory
///
/// # Example
///
/// ```no_run
/// use sediment_storage::{Directory, FsDirectory};
/// use std::path::Path;
///
/// let dir = FsDirectory::open(Path::new("/tmp/partition")).unwrap();
/// dir.commit("version.0", b"{}").unwrap();
/// ```
#[derive(Debug)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Opens a directory rooted at `root`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or is not a directory.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        if !root.is_dir() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a directory: {}", root.display()),
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        let name = name.trim_matches('/');
        if name.is_empty() {
            self.root.clone()
        } else {
            self.root.join(name)
        }
    }

    fn map_not_found(err: io::Error, name: &str) -> StorageError {
        if err.kind() == io::ErrorKind::NotFound {
            StorageError::not_found(name)
        } else {
            StorageError::Io(err)
        }
    }

    fn create_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Syncs the directory containing `path` so that renames and creations are durable.
    ///
    /// Windows NTFS journals metadata updates, so the explicit fsync is skipped there.
    #[cfg(unix)]
    fn sync_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent(_path: &Path) -> StorageResult<()> {
        Ok(())
    }
}

impl Directory for FsDirectory {
    fn make_directory(&self, name: &str) -> StorageResult<()> {
        fs::create_dir_all(self.path(name))?;
        Ok(())
    }

    fn store(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path(name);
        Self::create_parent(&path)?;
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn append(&self, name: &str, data: &[u8]) -> StorageResult<u64> {
        let path = self.path(name);
        Self::create_parent(&path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();
        file.write_all(data)?;
        file.sync_all()?;
        Ok(offset)
    }

    fn load(&self, name: &str) -> StorageResult<Vec<u8>> {
        fs::read(self.path(name)).map_err(|e| Self::map_not_found(e, name))
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let path = self.path(name);
        let meta = fs::metadata(&path).map_err(|e| Self::map_not_found(e, name))?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Self::sync_parent(&path)?;
        trace!(name, "removed");
        Ok(())
    }

    fn list(&self, name: &str) -> StorageResult<Vec<String>> {
        let entries = fs::read_dir(self.path(name)).map_err(|e| Self::map_not_found(e, name))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(file_name) = entry.file_name().to_str() {
                names.push(file_name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.path(from);
        let to_path = self.path(to);
        if !from_path.exists() {
            return Err(StorageError::not_found(from));
        }
        if from_path.is_dir() && to_path.exists() {
            return Err(StorageError::already_exists(to));
        }
        Self::create_parent(&to_path)?;
        fs::rename(&from_path, &to_path)?;
        Self::sync_parent(&to_path)?;
        Ok(())
    }

    fn size(&self, name: &str) -> StorageResult<u64> {
        let meta = fs::metadata(self.path(name)).map_err(|e| Self::map_not_found(e, name))?;
        Ok(meta.len())
    }

    fn commit(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let target = self.path(name);
        Self::create_parent(&target)?;
        let temp = self.path(&format!("{name}.tmp-{}", uuid::Uuid::new_v4().simple()));

        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Self::sync_parent(&target)?;
        Ok(())
    }
}
