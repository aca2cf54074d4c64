//! Shared pool of loaded segments.

use crate::error::CoreResult;
use crate::segment::built::BuiltSegment;
use crate::types::SegmentId;
use sediment_storage::Directory;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Loaded segments shared by every reader of a partition.
///
/// Readers hold `Arc`s to the segments they use. The arena keeps one more,
/// so a segment is only dropped from memory once the arena collects it and
/// the last reader referencing it is gone.
#[derive(Debug, Default)]
pub struct SegmentArena {
    segments: BTreeMap<SegmentId, Arc<BuiltSegment>>,
}

impl SegmentArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the loaded segment, if any.
    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<Arc<BuiltSegment>> {
        self.segments.get(&id).cloned()
    }

    /// Returns true if the segment is loaded.
    #[must_use]
    pub fn contains(&self, id: SegmentId) -> bool {
        self.segments.contains_key(&id)
    }

    /// Returns the loaded segment or loads it from `dir`.
    pub fn get_or_load(&mut self, dir: &dyn Directory, id: SegmentId) -> CoreResult<Arc<BuiltSegment>> {
        if let Some(segment) = self.segments.get(&id) {
            return Ok(Arc::clone(segment));
        }
        let segment = Arc::new(BuiltSegment::load(dir, id)?);
        self.segments.insert(id, Arc::clone(&segment));
        Ok(segment)
    }

    /// Registers an already loaded segment.
    pub fn insert(&mut self, segment: Arc<BuiltSegment>) {
        self.segments.insert(segment.id(), segment);
    }

    /// Drops every segment not in `live` that no reader references.
    ///
    /// Returns the ids removed.
    pub fn collect(&mut self, live: &HashSet<SegmentId>) -> Vec<SegmentId> {
        let removable: Vec<SegmentId> = self
            .segments
            .iter()
            .filter(|(id, segment)| !live.contains(id) && Arc::strong_count(segment) == 1)
            .map(|(id, _)| *id)
            .collect();
        for id in &removable {
            self.segments.remove(id);
        }
        if !removable.is_empty() {
            debug!(count = removable.len(), "collected unused segments");
        }
        removable
    }

    /// Number of loaded segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if no segment is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Memory held by every loaded segment.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        self.segments.values().map(|s| s.memory_use()).sum()
    }
}
