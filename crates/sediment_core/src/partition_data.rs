//! The segments backing a partition at one point in time.

use crate::error::CoreResult;
use crate::locator::Locator;
use crate::oplog::Operation;
use crate::segment::{BuildingSegment, BuiltSegment, SegmentArena, StoredDocument};
use crate::types::{DocId, SegmentId};
use crate::version::Version;
use sediment_storage::Directory;
use std::sync::Arc;

/// A segment as seen by readers: loaded from disk or still in memory.
#[derive(Debug, Clone)]
pub enum SegmentHandle {
    /// Persisted and loaded.
    Built(Arc<BuiltSegment>),
    /// Building or frozen, not yet loaded from disk.
    InMemory(Arc<BuildingSegment>),
}

impl SegmentHandle {
    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        match self {
            Self::Built(s) => s.id(),
            Self::InMemory(s) => s.id(),
        }
    }

    /// Finds the live document with `pk`, ignoring cross-segment patches.
    #[must_use]
    pub fn lookup(&self, pk: &str) -> Option<DocId> {
        match self {
            Self::Built(s) => s.lookup(pk),
            Self::InMemory(s) => s.lookup(pk),
        }
    }

    /// Returns a copy of document `doc_id`.
    #[must_use]
    pub fn document(&self, doc_id: DocId) -> Option<StoredDocument> {
        match self {
            Self::Built(s) => s.document(doc_id).cloned(),
            Self::InMemory(s) => s.document(doc_id),
        }
    }

    /// Ids of documents not superseded inside the segment.
    #[must_use]
    pub fn live_doc_ids(&self) -> Vec<DocId> {
        match self {
            Self::Built(s) => s.live_doc_ids().collect(),
            Self::InMemory(s) => s.live_doc_ids(),
        }
    }

    /// Furthest upstream position in the segment.
    #[must_use]
    pub fn locator(&self) -> Locator {
        match self {
            Self::Built(s) => s.info().locator,
            Self::InMemory(s) => s.locator(),
        }
    }

    /// Operations logged in the segment.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        match self {
            Self::Built(s) => s.operations().len(),
            Self::InMemory(s) => s.oplog().len(),
        }
    }

    /// Copies operations `[from, to)` of the segment's log.
    #[must_use]
    pub fn operations(&self, from: usize, to: usize) -> Vec<Operation> {
        match self {
            Self::Built(s) => {
                let ops = s.operations();
                let to = to.min(ops.len());
                if from >= to {
                    Vec::new()
                } else {
                    ops[from..to].to_vec()
                }
            }
            Self::InMemory(s) => s.oplog().range(from, to),
        }
    }

    /// Memory held by the segment.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        match self {
            Self::Built(s) => s.memory_use(),
            Self::InMemory(s) => s.memory_use(),
        }
    }

    /// Returns true for building and frozen in-memory segments.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }
}

/// The version plus every segment backing a partition.
///
/// - `built`: the version's segments, loaded
/// - `pending`: segments produced by the writer that the version does not
///   list yet (frozen in memory, or flushed to disk)
/// - `building`: the segment currently accepting documents
///
/// Cloning is cheap and yields an independent snapshot: later changes to the
/// writer's data (a new building segment, a committed version) are not
/// visible through the clone.
#[derive(Debug, Clone)]
pub struct PartitionData {
    version: Arc<Version>,
    built: Vec<Arc<BuiltSegment>>,
    pending: Vec<SegmentHandle>,
    building: Option<Arc<BuildingSegment>>,
}

impl PartitionData {
    /// Creates data for `version` with its loaded segments.
    #[must_use]
    pub fn new(version: Arc<Version>, built: Vec<Arc<BuiltSegment>>) -> Self {
        Self {
            version,
            built,
            pending: Vec::new(),
            building: None,
        }
    }

    /// Creates data for `version` without loading its segments.
    ///
    /// Offline writers only need the version to allocate ids and commit.
    #[must_use]
    pub fn unloaded(version: Version) -> Self {
        Self::new(Arc::new(version), Vec::new())
    }

    /// Loads every segment of `version` through `arena`.
    pub fn load(dir: &dyn Directory, version: Arc<Version>, arena: &mut SegmentArena) -> CoreResult<Self> {
        let built = version
            .segments()
            .iter()
            .map(|id| arena.get_or_load(dir, *id))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self::new(version, built))
    }

    /// Returns the version.
    #[must_use]
    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }

    /// Returns the version's loaded segments.
    #[must_use]
    pub fn built_segments(&self) -> &[Arc<BuiltSegment>] {
        &self.built
    }

    /// Returns the writer's segments not yet listed in the version.
    #[must_use]
    pub fn pending_segments(&self) -> &[SegmentHandle] {
        &self.pending
    }

    /// Returns the building segment.
    #[must_use]
    pub fn building(&self) -> Option<&Arc<BuildingSegment>> {
        self.building.as_ref()
    }

    /// Every segment, sorted by id (oldest first).
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentHandle> {
        let mut all: Vec<SegmentHandle> = self
            .built
            .iter()
            .cloned()
            .map(SegmentHandle::Built)
            .chain(self.pending.iter().cloned())
            .chain(self.building.iter().cloned().map(SegmentHandle::InMemory))
            .collect();
        all.sort_by_key(SegmentHandle::id);
        all
    }

    /// Writer segments whose operation logs are not covered by the version:
    /// pending segments followed by the building one, in id order.
    #[must_use]
    pub fn writer_segments(&self) -> Vec<SegmentHandle> {
        let mut all: Vec<SegmentHandle> = self
            .pending
            .iter()
            .cloned()
            .chain(self.building.iter().cloned().map(SegmentHandle::InMemory))
            .collect();
        all.sort_by_key(SegmentHandle::id);
        all
    }

    /// Ids of every segment.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments().iter().map(SegmentHandle::id).collect()
    }

    /// Replaces the building segment.
    pub fn set_building(&mut self, building: Option<Arc<BuildingSegment>>) {
        self.building = building;
    }

    /// Freezes the building segment and moves it to the pending list.
    pub fn freeze_building(&mut self) -> Option<Arc<BuildingSegment>> {
        let building = self.building.take()?;
        building.freeze();
        self.pending.push(SegmentHandle::InMemory(Arc::clone(&building)));
        Some(building)
    }

    /// Swaps the in-memory pending segment with the same id for its loaded form.
    ///
    /// Returns false if no in-memory segment with that id is pending.
    pub fn replace_pending(&mut self, built: Arc<BuiltSegment>) -> bool {
        for handle in &mut self.pending {
            if handle.id() == built.id() && handle.is_in_memory() {
                *handle = SegmentHandle::Built(built);
                return true;
            }
        }
        false
    }

    /// Removes pending segments whose whole content the version already covers.
    pub fn drop_pending_covered(&mut self) -> Vec<SegmentId> {
        let covered_by = self.version.locator();
        let mut dropped = Vec::new();
        self.pending.retain(|handle| {
            let covered = covered_by.covers(&handle.locator());
            if covered {
                dropped.push(handle.id());
            }
            !covered
        });
        dropped
    }

    /// Removes the given pending segments (committed into a version).
    pub fn remove_pending(&mut self, ids: &[SegmentId]) {
        self.pending.retain(|handle| !ids.contains(&handle.id()));
    }

    /// Sets a new version with its loaded segments, keeping writer segments.
    #[must_use]
    pub fn with_version(&self, version: Arc<Version>, built: Vec<Arc<BuiltSegment>>) -> Self {
        Self {
            version,
            built,
            pending: self.pending.clone(),
            building: self.building.clone(),
        }
    }

    /// Replaces the version without loading segments.
    pub fn set_version(&mut self, version: Arc<Version>) {
        self.version = version;
    }

    /// Takes the writer segments of `other`, keeping this data's version.
    pub fn adopt_writer_segments(&mut self, other: &PartitionData) {
        self.pending = other.pending.clone();
        self.building = other.building.clone();
    }

    /// The furthest upstream position any segment includes.
    #[must_use]
    pub fn locator(&self) -> Locator {
        self.writer_segments()
            .iter()
            .fold(self.version.locator(), |acc, h| acc.advance(h.locator()))
    }

    /// Memory held by in-memory writer segments.
    #[must_use]
    pub fn in_memory_use(&self) -> u64 {
        self.writer_segments()
            .iter()
            .filter(|h| h.is_in_memory())
            .map(SegmentHandle::memory_use)
            .sum()
    }

    /// Memory held by every segment.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        self.segments().iter().map(SegmentHandle::memory_use).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn building(id: u32, pks: &[&str], offset: i64) -> Arc<BuildingSegment> {
        let seg = BuildingSegment::new(SegmentId::new(id), 0, 100);
        for pk in pks {
            seg.apply(&Document::add(*pk).with_locator(Locator::new(0, offset)), 8)
                .unwrap();
        }
        Arc::new(seg)
    }

    #[test]
    fn snapshot_keeps_its_building_segment() {
        let mut data = PartitionData::unloaded(Version::empty());
        data.set_building(Some(building(1, &["a"], 1)));
        let snapshot = data.clone();

        data.freeze_building();
        data.set_building(Some(building(2, &[], 2)));

        assert_eq!(snapshot.segment_ids(), vec![SegmentId::new(1)]);
        assert_eq!(data.segment_ids(), vec![SegmentId::new(1), SegmentId::new(2)]);
        assert_eq!(data.pending_segments().len(), 1);
    }

    #[test]
    fn covered_pending_segments_are_dropped() {
        let mut editor = Version::empty().edit();
        editor.set_locator(Locator::new(0, 5));
        let version = Arc::new(editor.build());

        let mut data = PartitionData::new(Arc::clone(&version), Vec::new());
        data.set_building(Some(building(SegmentId::RT_MASK, &["a"], 3)));
        data.freeze_building();
        data.set_building(Some(building(SegmentId::RT_MASK + 1, &["b"], 9)));
        data.freeze_building();

        let dropped = data.drop_pending_covered();
        assert_eq!(dropped, vec![SegmentId::first_realtime()]);
        assert_eq!(data.pending_segments().len(), 1);
        assert_eq!(data.locator(), Locator::new(0, 9));
    }

    #[test]
    fn in_memory_use_counts_writer_segments() {
        let mut data = PartitionData::unloaded(Version::empty());
        data.set_building(Some(building(1, &["a", "b"], 1)));
        assert_eq!(data.in_memory_use(), 16);
    }
}
