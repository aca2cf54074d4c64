//! Directory trait definition.

use crate::error::StorageResult;
use std::fmt;
use std::sync::Arc;

/// A named-blob store used by the index engine.
///
/// # Invariants
///
/// - `store` replaces the whole blob; `append` returns the offset the data was written at
/// - `load` returns exactly the bytes previously stored
/// - `commit` is atomic with respect to `load`: a partially written blob is never observable
/// - `remove` on a directory name removes everything below it
/// - Implementations must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryDirectory`] - For testing
/// - [`super::FsDirectory`] - For persistent storage
/// - [`super::SubDirectory`] - Prefixed view into another directory
pub trait Directory: Send + Sync + fmt::Debug {
    /// Creates a directory (and any missing ancestors).
    ///
    /// Creating a directory that already exists is not an error.
    fn make_directory(&self, name: &str) -> StorageResult<()>;

    /// Stores `data` under `name`, replacing any previous blob.
    ///
    /// Parent directories are created if needed.
    fn store(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    /// Appends `data` to the blob `name`, creating it if absent.
    ///
    /// Returns the offset where the data was written.
    fn append(&self, name: &str, data: &[u8]) -> StorageResult<u64>;

    /// Loads the whole blob stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if the blob does not exist.
    fn load(&self, name: &str) -> StorageResult<Vec<u8>>;

    /// Returns true if a blob or directory exists under `name`.
    fn exists(&self, name: &str) -> bool;

    /// Removes a blob, or a directory and everything below it.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Lists the immediate children of the directory `name` (`""` is the root).
    ///
    /// Results are sorted by name.
    fn list(&self, name: &str) -> StorageResult<Vec<String>>;

    /// Renames a blob or directory.
    ///
    /// Renaming a blob over an existing blob replaces it; renaming a
    /// directory over an existing name fails with `AlreadyExists`.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Returns the size in bytes of the blob `name`.
    fn size(&self, name: &str) -> StorageResult<u64>;

    /// Atomically publishes `data` under `name` (write-then-rename).
    fn commit(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let temp = format!("{name}.__tmp__");
        self.store(&temp, data)?;
        self.rename(&temp, name)
    }
}

/// Joins two directory-relative names with `/`.
///
/// Empty components are skipped, so `join("", "a")` is `"a"`.
#[must_use]
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_matches('/');
    let name = name.trim_matches('/');
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{name}"),
    }
}

/// A view of another directory rooted at a prefix.
///
/// Used for parallel-build shard directories (`parallel_<i>`) and for the
/// real-time partition directory.
#[derive(Clone)]
pub struct SubDirectory {
    parent: Arc<dyn Directory>,
    prefix: String,
}

impl SubDirectory {
    /// Creates the prefix in `parent` and returns a view rooted at it.
    pub fn create(parent: Arc<dyn Directory>, prefix: &str) -> StorageResult<Self> {
        parent.make_directory(prefix)?;
        Ok(Self::new(parent, prefix))
    }

    /// Returns a view rooted at `prefix` without creating it.
    #[must_use]
    pub fn new(parent: Arc<dyn Directory>, prefix: &str) -> Self {
        Self {
            parent,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Returns the prefix of this view inside its parent.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn path(&self, name: &str) -> String {
        join(&self.prefix, name)
    }
}

impl fmt::Debug for SubDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubDirectory")
            .field("prefix", &self.prefix)
            .field("parent", &self.parent)
            .finish()
    }
}

impl Directory for SubDirectory {
    fn make_directory(&self, name: &str) -> StorageResult<()> {
        self.parent.make_directory(&self.path(name))
    }

    fn store(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        self.parent.store(&self.path(name), data)
    }

    fn append(&self, name: &str, data: &[u8]) -> StorageResult<u64> {
        self.parent.append(&self.path(name), data)
    }

    fn load(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.parent.load(&self.path(name))
    }

    fn exists(&self, name: &str) -> bool {
        self.parent.exists(&self.path(name))
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.parent.remove(&self.path(name))
    }

    fn list(&self, name: &str) -> StorageResult<Vec<String>> {
        self.parent.list(&self.path(name))
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.parent.rename(&self.path(from), &self.path(to))
    }

    fn size(&self, name: &str) -> StorageResult<u64> {
        self.parent.size(&self.path(name))
    }

    fn commit(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        self.parent.commit(&self.path(name), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryDirectory;

    #[test]
    fn join_skips_empty_components() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a/", "/b"), "a/b");
    }

    #[test]
    fn sub_directory_prefixes_names() {
        let root: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let sub = SubDirectory::create(Arc::clone(&root), "parallel_0").unwrap();

        sub.store("version.1", b"v1").unwrap();

        assert!(root.exists("parallel_0/version.1"));
        assert_eq!(sub.load("version.1").unwrap(), b"v1");
        assert_eq!(sub.list("").unwrap(), vec!["version.1".to_string()]);
    }

    #[test]
    fn default_commit_leaves_no_temp_file() {
        let root = InMemoryDirectory::new();
        root.commit("version.3", b"data").unwrap();
        assert_eq!(root.list("").unwrap(), vec!["version.3".to_string()]);
    }
}
