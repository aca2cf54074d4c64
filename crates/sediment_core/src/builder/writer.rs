//! The partition writer: owns the building segment of a partition.

use crate::builder::dump::DumpQueue;
use crate::config::BuildConfig;
use crate::context::EngineContext;
use crate::counter::{names, CounterMap};
use crate::document::{Document, DocumentKind};
use crate::error::{CoreError, CoreResult};
use crate::merger::ParallelBuildInfo;
use crate::partition_data::PartitionData;
use crate::reader::{PatchModifier, PatchOverlay};
use crate::segment::{Applied, BuildingSegment};
use crate::types::{SegmentId, Timestamp, INVALID_TIMESTAMP};
use crate::version::{Version, VersionStore};
use sediment_storage::Directory;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a writer's segments go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    /// Offline build: segments are committed into versions of the writer's directory.
    Offline,
    /// Real-time build: segments live in memory (and the rt directory) until
    /// an incremental version covers them.
    Realtime,
}

/// Hands out segment ids that were never used in the partition.
///
/// Parallel shard `i` of `n` allocates `base + 1 + i`, `base + 1 + i + n`, ...
/// so shards never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentIdAllocator {
    next: u32,
    step: u32,
}

impl SegmentIdAllocator {
    /// Allocates offline ids after every id in `version` and in `dir`.
    pub fn offline(version: &Version, dir: &dyn Directory, shard: Option<&ParallelBuildInfo>) -> CoreResult<Self> {
        let versioned = version
            .segments()
            .iter()
            .filter(|id| !id.is_realtime())
            .max()
            .map(|id| id.as_u32() + 1)
            .unwrap_or(0);
        let on_disk = segment_dirs(dir)?
            .into_iter()
            .filter(|id| !id.is_realtime())
            .max()
            .map(|id| id.as_u32() + 1)
            .unwrap_or(0);

        let mut allocator = match shard {
            Some(info) => Self {
                next: versioned + info.instance_id,
                step: info.parallel_num.max(1),
            },
            None => Self { next: versioned, step: 1 },
        };
        while allocator.next < on_disk {
            allocator.next += allocator.step;
        }
        Ok(allocator)
    }

    /// Allocates real-time ids after every real-time id in `data` and `dir`.
    pub fn realtime(data: &PartitionData, dir: &dyn Directory) -> CoreResult<Self> {
        let used = data
            .segment_ids()
            .into_iter()
            .chain(segment_dirs(dir)?)
            .filter(|id| id.is_realtime())
            .max()
            .map(|id| id.as_u32() + 1)
            .unwrap_or(SegmentId::RT_MASK);
        Ok(Self { next: used, step: 1 })
    }

    /// Returns the next id without allocating it.
    #[must_use]
    pub fn peek(&self) -> SegmentId {
        SegmentId::new(self.next)
    }

    /// Allocates an id.
    pub fn allocate(&mut self) -> SegmentId {
        let id = SegmentId::new(self.next);
        self.next += self.step;
        id
    }
}

fn segment_dirs(dir: &dyn Directory) -> CoreResult<Vec<SegmentId>> {
    Ok(dir
        .list("")?
        .iter()
        .filter_map(|name| SegmentId::from_dir_name(name))
        .collect())
}

/// Writes documents into the building segment of one [`PartitionData`].
///
/// The writer never touches built segments. Documents that change keys in
/// older segments are logged; a real-time writer with an overlay also applies
/// them to the overlay so the published reader sees them at once.
#[derive(Debug)]
pub struct PartitionWriter {
    ctx: Arc<EngineContext>,
    dir: Arc<dyn Directory>,
    data: PartitionData,
    mode: WriterMode,
    max_docs: usize,
    async_dump: bool,
    shard: Option<u32>,
    allocator: SegmentIdAllocator,
    dump_queue: Arc<DumpQueue>,
    overlay: Option<Arc<PatchOverlay>>,
    counters: Arc<CounterMap>,
}

impl PartitionWriter {
    /// Creates a writer.
    pub fn new(
        ctx: Arc<EngineContext>,
        dir: Arc<dyn Directory>,
        data: PartitionData,
        config: &BuildConfig,
        mode: WriterMode,
        dump_queue: Arc<DumpQueue>,
        counters: Arc<CounterMap>,
    ) -> CoreResult<Self> {
        let allocator = match mode {
            WriterMode::Offline => {
                SegmentIdAllocator::offline(data.version(), dir.as_ref(), config.parallel.as_ref())?
            }
            WriterMode::Realtime => SegmentIdAllocator::realtime(&data, dir.as_ref())?,
        };
        debug!(?mode, next_segment = %allocator.peek(), "created partition writer");
        Ok(Self {
            ctx,
            dir,
            data,
            mode,
            max_docs: config.max_docs_per_segment,
            async_dump: config.enable_async_dump,
            shard: config.parallel.as_ref().map(|p| p.instance_id),
            allocator,
            dump_queue,
            overlay: None,
            counters,
        })
    }

    /// Returns the writer mode.
    #[must_use]
    pub fn mode(&self) -> WriterMode {
        self.mode
    }

    /// Returns the directory segments are dumped into.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    /// Returns the writer's data.
    #[must_use]
    pub fn data(&self) -> &PartitionData {
        &self.data
    }

    /// Replaces the writer's data, keeping the id allocator.
    ///
    /// Used by reopen to move the writer onto a new version.
    pub fn switch_data(&mut self, data: PartitionData) {
        self.data = data;
    }

    /// Sets the overlay real-time changes to older segments are applied to.
    pub fn set_overlay(&mut self, overlay: Option<Arc<PatchOverlay>>) {
        self.overlay = overlay;
    }

    /// Returns the overlay.
    #[must_use]
    pub fn overlay(&self) -> Option<&Arc<PatchOverlay>> {
        self.overlay.as_ref()
    }

    /// Returns the dump queue.
    #[must_use]
    pub fn dump_queue(&self) -> &Arc<DumpQueue> {
        &self.dump_queue
    }

    /// Estimated memory a document needs.
    #[must_use]
    pub fn estimate_doc_memory(&self, doc: &Document) -> u64 {
        self.ctx.strategy().estimate_doc_memory(doc)
    }

    /// Memory of the building segment.
    #[must_use]
    pub fn building_memory(&self) -> u64 {
        self.data.building().map_or(0, |b| b.memory_use())
    }

    /// Memory of the building segment plus segments waiting to be dumped.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.building_memory() + self.dump_queue.pending_memory()
    }

    /// Returns true if the building segment is absent or nothing was applied.
    #[must_use]
    pub fn is_building_empty(&self) -> bool {
        self.data.building().map_or(true, |b| b.is_empty())
    }

    /// Returns true if documents were applied that no version lists yet.
    #[must_use]
    pub fn has_uncommitted(&self) -> bool {
        !self.is_building_empty() || !self.data.pending_segments().is_empty()
    }

    /// Returns true if every pending segment is on disk.
    #[must_use]
    pub fn pending_flushed(&self) -> bool {
        self.data.pending_segments().iter().all(|h| !h.is_in_memory())
    }

    /// Allocates a fresh building segment.
    pub fn reopen_new_segment(&mut self) -> Arc<BuildingSegment> {
        let id = self.allocator.allocate();
        let segment = Arc::new(
            BuildingSegment::new(id, self.ctx.schema().schema_id, self.max_docs).with_shard(self.shard),
        );
        self.data.set_building(Some(Arc::clone(&segment)));
        debug!(segment = %id, "opened building segment");
        segment
    }

    /// Applies a document to the building segment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::OutOfMemory`] if the segment is full.
    pub fn add_document(&mut self, doc: &Document) -> CoreResult<Applied> {
        let building = match self.data.building() {
            Some(b) => Arc::clone(b),
            None => self.reopen_new_segment(),
        };
        let applied = building.apply(doc, self.estimate_doc_memory(doc))?;

        // A live building copy already hid every older copy, so only updates
        // of a key hidden by a reopen reach an older segment here.
        if let Some(overlay) = &self.overlay {
            PatchModifier::new(&self.data, overlay).apply(&applied.op);
        }

        let counter = match (self.mode, doc.kind) {
            (WriterMode::Realtime, _) => names::ONLINE_BUILD_DOC_COUNT,
            (WriterMode::Offline, DocumentKind::Add) => names::ADD_DOC_COUNT,
            (WriterMode::Offline, DocumentKind::Update) => names::UPDATE_DOC_COUNT,
            (WriterMode::Offline, DocumentKind::Delete) => names::DELETE_DOC_COUNT,
        };
        self.counters.acc(counter).increment(1);
        Ok(applied)
    }

    /// Freezes the building segment and queues it for dumping.
    ///
    /// An empty building segment is discarded. Without async dump the segment
    /// is written before returning. Returns the frozen segment's id.
    pub fn dump_segment(&mut self) -> CoreResult<Option<SegmentId>> {
        if self.is_building_empty() {
            self.data.set_building(None);
            return Ok(None);
        }
        let Some(segment) = self.data.freeze_building() else {
            return Ok(None);
        };
        let id = segment.id();
        self.dump_queue.push(segment, Arc::clone(&self.dir));
        let counter = match self.mode {
            WriterMode::Offline => names::DUMP_SEGMENT_COUNT,
            WriterMode::Realtime => names::ONLINE_DUMP_SEGMENT_COUNT,
        };
        self.counters.acc(counter).increment(1);
        if !self.async_dump {
            self.dump_queue.flush()?;
            self.collect_dumped();
        }
        Ok(Some(id))
    }

    /// Swaps dumped segments into the pending list in their loaded form.
    pub fn collect_dumped(&mut self) -> Vec<SegmentId> {
        self.dump_queue
            .take_completed()
            .into_iter()
            .filter_map(|built| {
                let id = built.id();
                self.data.replace_pending(built).then_some(id)
            })
            .collect()
    }

    /// Dumps everything and commits a version holding the pending segments.
    ///
    /// `timestamp` is recorded unless it is [`INVALID_TIMESTAMP`]. Returns
    /// `None` when there is nothing to commit.
    pub fn commit_version(&mut self, store: &VersionStore, timestamp: Timestamp) -> CoreResult<Option<Arc<Version>>> {
        self.dump_segment()?;
        self.dump_queue.drain()?;
        self.collect_dumped();
        self.commit_pending(store, timestamp)
    }

    /// Commits a version holding the pending segments dumped so far.
    ///
    /// The building segment is left alone. Pending segments still in memory
    /// (queued or being dumped) make the commit fail.
    pub fn commit_pending(&mut self, store: &VersionStore, timestamp: Timestamp) -> CoreResult<Option<Arc<Version>>> {
        let pending = self.data.pending_segments();
        if let Some(unflushed) = pending.iter().find(|h| h.is_in_memory()) {
            return Err(CoreError::inconsistent(format!(
                "segment {} is not dumped yet",
                unflushed.id()
            )));
        }
        let base = Arc::clone(self.data.version());
        let stamp_changed = timestamp != INVALID_TIMESTAMP && timestamp != base.timestamp();
        if pending.is_empty() && !stamp_changed {
            return Ok(None);
        }

        let mut editor = base.edit();
        let mut committed = Vec::with_capacity(pending.len());
        for handle in pending {
            editor.add_segment(handle.id()).advance_locator(handle.locator());
            committed.push(handle.id());
        }
        if timestamp != INVALID_TIMESTAMP {
            editor.set_timestamp(timestamp);
        }
        editor.set_schema_version(self.ctx.schema().schema_id);
        let version = editor.build();
        version.check_successor(&base, &[])?;
        store.commit(&version)?;

        let version = Arc::new(version);
        self.data.set_version(Arc::clone(&version));
        self.data.remove_pending(&committed);
        info!(version = %version.id(), segments = committed.len(), "writer committed version");
        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Schema;
    use crate::types::VersionId;
    use sediment_storage::InMemoryDirectory;

    fn writer(dir: &Arc<dyn Directory>, config: &BuildConfig) -> PartitionWriter {
        let ctx = Arc::new(EngineContext::normal(Schema::new("t")));
        ctx.create_writer(
            Arc::clone(dir),
            PartitionData::unloaded(Version::empty()),
            config,
            Arc::new(DumpQueue::new()),
            Arc::new(CounterMap::new()),
        )
        .unwrap()
    }

    #[test]
    fn commit_adds_dumped_segments() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let store = VersionStore::new(Arc::clone(&dir));
        let mut writer = writer(&dir, &BuildConfig::default());

        writer.add_document(&Document::add("a")).unwrap();
        assert_eq!(writer.dump_segment().unwrap(), Some(SegmentId::new(0)));
        writer.add_document(&Document::add("b")).unwrap();

        let version = writer.commit_version(&store, 42).unwrap().unwrap();
        assert_eq!(version.id(), VersionId::new(1));
        assert_eq!(version.segments(), &[SegmentId::new(0), SegmentId::new(1)]);
        assert_eq!(version.timestamp(), 42);
        assert!(writer.data().pending_segments().is_empty());
        assert!(writer.commit_version(&store, INVALID_TIMESTAMP).unwrap().is_none());
    }

    #[test]
    fn empty_building_segment_is_discarded() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let mut writer = writer(&dir, &BuildConfig::default());
        writer.reopen_new_segment();
        assert_eq!(writer.dump_segment().unwrap(), None);
        assert!(writer.data().building().is_none());
    }

    #[test]
    fn ids_skip_orphan_segment_dirs() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        dir.make_directory("segment_7").unwrap();
        let mut writer = writer(&dir, &BuildConfig::default());
        assert_eq!(writer.reopen_new_segment().id(), SegmentId::new(8));
    }

    #[test]
    fn shard_ids_interleave() {
        let dir = InMemoryDirectory::new();
        let mut editor = Version::empty().edit();
        editor.add_segment(SegmentId::new(0)).add_segment(SegmentId::new(1));
        let base = editor.build();
        let info = ParallelBuildInfo::new(3, 1, 7, base.id());

        let mut allocator = SegmentIdAllocator::offline(&base, &dir, Some(&info)).unwrap();
        assert_eq!(allocator.allocate(), SegmentId::new(3));
        assert_eq!(allocator.allocate(), SegmentId::new(6));
    }

    #[test]
    fn realtime_ids_carry_mask() {
        let dir = InMemoryDirectory::new();
        dir.make_directory(&SegmentId::first_realtime().dir_name()).unwrap();
        let data = PartitionData::unloaded(Version::empty());
        let mut allocator = SegmentIdAllocator::realtime(&data, &dir).unwrap();
        let id = allocator.allocate();
        assert!(id.is_realtime());
        assert_eq!(id, SegmentId::first_realtime().advance(1));
    }
}
