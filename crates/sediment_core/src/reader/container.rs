//! Bounded history of published readers.

use crate::reader::PartitionReader;
use crate::types::{SegmentId, VersionId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Readers published by an online partition, oldest first.
///
/// The newest reader is always kept. An older reader is evicted once no
/// query holds it any more (its `Arc` is only referenced by the container).
/// The container may temporarily hold more than `capacity` readers when old
/// ones are still in use.
#[derive(Debug)]
pub struct ReaderContainer {
    capacity: usize,
    readers: Mutex<VecDeque<Arc<PartitionReader>>>,
}

impl ReaderContainer {
    /// Creates a container keeping up to `capacity` readers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            readers: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds the newly published reader, evicting unused old ones over capacity.
    pub fn add(&self, reader: Arc<PartitionReader>) {
        let mut readers = self.readers.lock();
        readers.push_back(reader);
        while readers.len() > self.capacity {
            let Some(pos) = (0..readers.len() - 1).find(|i| Arc::strong_count(&readers[*i]) == 1) else {
                warn!(
                    readers = readers.len(),
                    capacity = self.capacity,
                    "reader container over capacity, old readers still in use"
                );
                break;
            };
            readers.remove(pos);
        }
    }

    /// Drops every reader except the newest that no query holds.
    ///
    /// Returns the number of readers evicted.
    pub fn evict_unused(&self) -> usize {
        let mut readers = self.readers.lock();
        let newest = readers.len().saturating_sub(1);
        let before = readers.len();
        let mut index = 0;
        readers.retain(|reader| {
            let keep = index == newest || Arc::strong_count(reader) > 1;
            index += 1;
            keep
        });
        let evicted = before - readers.len();
        if evicted > 0 {
            debug!(evicted, remaining = readers.len(), "evicted unused readers");
        }
        evicted
    }

    /// Returns the newest reader.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<PartitionReader>> {
        self.readers.lock().back().cloned()
    }

    /// Segment ids referenced by any held reader.
    #[must_use]
    pub fn used_segments(&self) -> HashSet<SegmentId> {
        self.readers
            .lock()
            .iter()
            .flat_map(|reader| reader.segment_ids())
            .collect()
    }

    /// Version ids referenced by any held reader.
    #[must_use]
    pub fn used_versions(&self) -> BTreeSet<VersionId> {
        self.readers
            .lock()
            .iter()
            .map(|reader| reader.version_id())
            .collect()
    }

    /// Returns true if a reader on version `id` is held.
    #[must_use]
    pub fn has_version(&self, id: VersionId) -> bool {
        self.readers.lock().iter().any(|reader| reader.version_id() == id)
    }

    /// Number of readers held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.readers.lock().len()
    }

    /// Returns true if no reader is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readers.lock().is_empty()
    }

    /// Memory held by all readers (shared segments counted once per reader).
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        self.readers
            .lock()
            .iter()
            .map(|reader| reader.estimated_memory_use())
            .sum()
    }

    /// Drops every reader.
    pub fn clear(&self) {
        self.readers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition_data::PartitionData;
    use crate::version::Version;

    fn reader(version: u32) -> Arc<PartitionReader> {
        let version = Version::empty().edit().with_id(VersionId::new(version)).build();
        Arc::new(PartitionReader::open(PartitionData::unloaded(version)))
    }

    #[test]
    fn unused_readers_are_evicted_over_capacity() {
        let container = ReaderContainer::new(2);
        container.add(reader(1));
        container.add(reader(2));
        container.add(reader(3));

        assert_eq!(container.len(), 2);
        assert!(!container.has_version(VersionId::new(1)));
        assert_eq!(container.latest().unwrap().version_id(), VersionId::new(3));
    }

    #[test]
    fn held_readers_survive_eviction() {
        let container = ReaderContainer::new(1);
        let held = reader(1);
        container.add(Arc::clone(&held));
        container.add(reader(2));

        assert_eq!(container.len(), 2);
        drop(held);
        assert_eq!(container.evict_unused(), 1);
        assert_eq!(container.used_versions().into_iter().collect::<Vec<_>>(), vec![VersionId::new(2)]);
    }

    #[test]
    fn newest_reader_is_never_evicted() {
        let container = ReaderContainer::new(4);
        container.add(reader(1));
        assert_eq!(container.evict_unused(), 0);
        assert_eq!(container.len(), 1);
    }
}
