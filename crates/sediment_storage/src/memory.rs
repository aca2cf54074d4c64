//! In-memory directory for testing.

use crate::directory::{join, Directory};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Entry {
    File(Vec<u8>),
    Dir,
}

/// An in-memory directory.
///
/// This directory keeps every blob in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral partitions that don't need persistence
///
/// # Thread Safety
///
/// This directory is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use sediment_storage::{Directory, InMemoryDirectory};
///
/// let dir = InMemoryDirectory::new();
/// let offset = dir.append("segment_0/operation_log", b"abc").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(dir.size("segment_0/operation_log").unwrap(), 3);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: RwLock<BTreeMap<String, Entry>>,
}

fn normalize(name: &str) -> String {
    join("", name)
}

fn ancestors(name: &str) -> impl Iterator<Item = &str> {
    name.match_indices('/').map(move |(idx, _)| &name[..idx])
}

fn is_below(key: &str, dir: &str) -> bool {
    dir.is_empty() || (key.len() > dir.len() && key.starts_with(dir) && key.as_bytes()[dir.len()] == b'/')
}

impl InMemoryDirectory {
    /// Creates a new empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of blobs (not directories) stored.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| matches!(e, Entry::File(_)))
            .count()
    }

    /// Returns the total number of bytes held.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .read()
            .values()
            .map(|e| match e {
                Entry::File(data) => data.len() as u64,
                Entry::Dir => 0,
            })
            .sum()
    }

    fn ensure_parents(entries: &mut BTreeMap<String, Entry>, name: &str) -> StorageResult<()> {
        for parent in ancestors(name) {
            match entries.get(parent) {
                Some(Entry::File(_)) => {
                    return Err(StorageError::already_exists(parent));
                }
                Some(Entry::Dir) => {}
                None => {
                    entries.insert(parent.to_string(), Entry::Dir);
                }
            }
        }
        Ok(())
    }
}

impl Directory for InMemoryDirectory {
    fn make_directory(&self, name: &str) -> StorageResult<()> {
        let name = normalize(name);
        if name.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &name)?;
        match entries.get(&name) {
            Some(Entry::File(_)) => Err(StorageError::already_exists(name)),
            Some(Entry::Dir) => Ok(()),
            None => {
                entries.insert(name, Entry::Dir);
                Ok(())
            }
        }
    }

    fn store(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let name = normalize(name);
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &name)?;
        if let Some(Entry::Dir) = entries.get(&name) {
            return Err(StorageError::already_exists(name));
        }
        entries.insert(name, Entry::File(data.to_vec()));
        Ok(())
    }

    fn append(&self, name: &str, data: &[u8]) -> StorageResult<u64> {
        let name = normalize(name);
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &name)?;
        match entries
            .entry(name.clone())
            .or_insert_with(|| Entry::File(Vec::new()))
        {
            Entry::File(existing) => {
                let offset = existing.len() as u64;
                existing.extend_from_slice(data);
                Ok(offset)
            }
            Entry::Dir => Err(StorageError::already_exists(name)),
        }
    }

    fn load(&self, name: &str) -> StorageResult<Vec<u8>> {
        let name = normalize(name);
        match self.entries.read().get(&name) {
            Some(Entry::File(data)) => Ok(data.clone()),
            _ => Err(StorageError::not_found(name)),
        }
    }

    fn exists(&self, name: &str) -> bool {
        let name = normalize(name);
        name.is_empty() || self.entries.read().contains_key(&name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let name = normalize(name);
        let mut entries = self.entries.write();
        if entries.remove(&name).is_none() {
            return Err(StorageError::not_found(name));
        }
        entries.retain(|key, _| !is_below(key, &name));
        Ok(())
    }

    fn list(&self, name: &str) -> StorageResult<Vec<String>> {
        let name = normalize(name);
        let entries = self.entries.read();
        if !name.is_empty() && !matches!(entries.get(&name), Some(Entry::Dir)) {
            return Err(StorageError::not_found(name));
        }
        let skip = if name.is_empty() { 0 } else { name.len() + 1 };
        let mut children: Vec<String> = entries
            .keys()
            .filter(|key| is_below(key, &name))
            .map(|key| &key[skip..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        children.sort();
        Ok(children)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut entries = self.entries.write();
        let entry = entries
            .get(&from)
            .cloned()
            .ok_or_else(|| StorageError::not_found(from.clone()))?;

        match (&entry, entries.get(&to)) {
            (Entry::Dir, Some(_)) | (Entry::File(_), Some(Entry::Dir)) => {
                return Err(StorageError::already_exists(to));
            }
            _ => {}
        }

        Self::ensure_parents(&mut entries, &to)?;
        let moved: Vec<(String, Entry)> = entries
            .iter()
            .filter(|(key, _)| is_below(key, &from))
            .map(|(key, value)| (format!("{to}{}", &key[from.len()..]), value.clone()))
            .collect();
        entries.retain(|key, _| key != &from && !is_below(key, &from));
        entries.insert(to, entry);
        entries.extend(moved);
        Ok(())
    }

    fn size(&self, name: &str) -> StorageResult<u64> {
        let name = normalize(name);
        match self.entries.read().get(&name) {
            Some(Entry::File(data)) => Ok(data.len() as u64),
            _ => Err(StorageError::not_found(name)),
        }
    }
}
