//! The build admission loop.
//!
//! [`IndexBuilder`] turns documents into committed versions without
//! exceeding the configured build memory:
//!
//! - every document goes into the writer's building segment
//! - when the next document would not fit the free quota the building
//!   segment is dumped (and, without async dump, committed) first
//! - a full segment is dumped and the document retried exactly once
//! - the memory-control task forces queued dumps out when the dump backlog
//!   plus the building segment exceed the budget
//! - `end_index` dumps everything and commits a version with the given
//!   timestamp

mod batch;
mod dump;
mod writer;

pub use batch::DocumentBatcher;
pub use dump::{DumpQueue, DumpTask};
pub use writer::{PartitionWriter, SegmentIdAllocator, WriterMode};

use crate::background::{BackgroundTask, TaskGroup};
use crate::config::BuildConfig;
use crate::context::EngineContext;
use crate::counter::{names, CounterMap};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::partition_data::PartitionData;
use crate::status::BuildStatus;
use crate::types::{Timestamp, INVALID_TIMESTAMP};
use crate::version::{Version, VersionStore};
use parking_lot::Mutex;
use sediment_storage::{Directory, SubDirectory};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[cfg(feature = "std")]
use crate::lock::DirectoryLock;

/// Lifecycle of an [`IndexBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    /// Accepting documents.
    Building,
    /// `end_index` finished; streaming tables may resume building.
    Ended,
    /// Closed; nothing is accepted.
    Closed,
}

#[derive(Debug)]
struct BuilderInner {
    state: BuilderState,
    writer: PartitionWriter,
    batcher: Option<DocumentBatcher>,
}

#[derive(Debug)]
struct BuilderShared {
    ctx: Arc<EngineContext>,
    config: BuildConfig,
    root: Arc<dyn Directory>,
    dir: Arc<dyn Directory>,
    store: VersionStore,
    inner: Mutex<BuilderInner>,
    dump_queue: Arc<DumpQueue>,
    counters: Arc<CounterMap>,
}

/// Offline builder of one partition directory.
///
/// With [`BuildConfig::parallel`] set, the builder is one shard of a
/// parallel build and writes into `parallel_<instance>` below the root.
#[derive(Debug)]
pub struct IndexBuilder {
    shared: Arc<BuilderShared>,
    tasks: Mutex<TaskGroup>,
    #[cfg(feature = "std")]
    lock: Mutex<Option<DirectoryLock>>,
}

const MEMORY_CONTROL_TASK: &str = "memory-control";
const ASYNC_DUMP_TASK: &str = "async-dump";

impl IndexBuilder {
    /// Opens a builder over the partition root `dir`.
    pub fn open(ctx: Arc<EngineContext>, dir: Arc<dyn Directory>, config: BuildConfig) -> CoreResult<Self> {
        let (work_dir, version) = Self::resolve_work_dir(&dir, &config)?;
        let dump_queue = Arc::new(DumpQueue::new());
        let counters = Arc::new(CounterMap::new());
        let writer = ctx.create_writer(
            Arc::clone(&work_dir),
            PartitionData::unloaded(version),
            &config,
            Arc::clone(&dump_queue),
            Arc::clone(&counters),
        )?;
        let batcher = config
            .batch
            .enabled
            .then(|| DocumentBatcher::new(config.batch.clone()));

        let shared = Arc::new(BuilderShared {
            ctx,
            store: VersionStore::new(Arc::clone(&work_dir)),
            root: dir,
            dir: work_dir,
            inner: Mutex::new(BuilderInner {
                state: BuilderState::Building,
                writer,
                batcher,
            }),
            dump_queue,
            counters,
            config,
        });
        let tasks = Self::spawn_tasks(&shared)?;
        info!(
            version = %shared.version().id(),
            parallel = shared.config.parallel.is_some(),
            "index builder opened"
        );
        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
            #[cfg(feature = "std")]
            lock: Mutex::new(None),
        })
    }

    /// Opens a builder over a partition on the local file system, holding
    /// the partition lock until [`IndexBuilder::close`].
    ///
    /// A shard builder locks its shard directory only, so the shards of one
    /// parallel build can run side by side.
    #[cfg(feature = "std")]
    pub fn open_path(ctx: Arc<EngineContext>, path: &std::path::Path, config: BuildConfig) -> CoreResult<Self> {
        let lock = match &config.parallel {
            Some(info) => DirectoryLock::acquire(&path.join(info.dir_name()))?,
            None => DirectoryLock::acquire(path)?,
        };
        let dir: Arc<dyn Directory> = Arc::new(sediment_storage::FsDirectory::open(path)?);
        let builder = Self::open(ctx, dir, config)?;
        *builder.lock.lock() = Some(lock);
        Ok(builder)
    }

    /// Picks the directory the builder writes into and the version it
    /// starts from.
    fn resolve_work_dir(root: &Arc<dyn Directory>, config: &BuildConfig) -> CoreResult<(Arc<dyn Directory>, Version)> {
        let root_store = VersionStore::new(Arc::clone(root));
        let Some(info) = &config.parallel else {
            return Ok((Arc::clone(root), root_store.load_or_empty(None)?));
        };
        info.validate()?;
        let shard: Arc<dyn Directory> = Arc::new(SubDirectory::create(Arc::clone(root), &info.dir_name())?);
        info.store(shard.as_ref())?;

        let shard_store = VersionStore::new(Arc::clone(&shard));
        let version = match shard_store.load_latest()? {
            Some(version) => version,
            None if info.base_version == crate::types::VersionId::INITIAL => Version::empty(),
            None => root_store.load(info.base_version)?,
        };
        debug!(shard = %info.dir_name(), base = %info.base_version, "opened parallel build shard");
        Ok((shard, version))
    }

    fn spawn_tasks(shared: &Arc<BuilderShared>) -> CoreResult<TaskGroup> {
        let mut tasks = TaskGroup::new();
        let interval = shared.config.memory_control_interval();
        if shared.config.enable_async_dump {
            let queue = Arc::clone(&shared.dump_queue);
            let task = BackgroundTask::spawn_periodic(ASYNC_DUMP_TASK, interval, move || queue.flush().map(|_| ()))?;
            shared.dump_queue.set_notifier(task.notifier());
            tasks.push(task);
        }
        if shared.config.enable_background_tasks {
            let control = Arc::clone(shared);
            tasks.push(BackgroundTask::spawn_periodic(MEMORY_CONTROL_TASK, interval, move || {
                control.execute_build_memory_control()
            })?);
        }
        Ok(tasks)
    }

    /// Builds one document.
    ///
    /// Returns false if the document was dropped: the builder is not
    /// building, the table rejected the document, or it did not fit even
    /// after a dump.
    pub fn build(&self, doc: Document) -> bool {
        self.shared.build(doc)
    }

    /// Flushes everything and commits a version stamped `timestamp`.
    ///
    /// [`INVALID_TIMESTAMP`] keeps the previous timestamp; parallel shards
    /// end this way and get their timestamp when merged.
    pub fn end_index(&self, timestamp: Timestamp) -> BuildStatus {
        match self.shared.end_index(timestamp) {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "end index failed");
                BuildStatus::from(&e)
            }
        }
    }

    /// Merges the partition's segments.
    pub fn merge(&self, optimize: bool, current_ts: Timestamp) -> BuildStatus {
        let mut inner = self.shared.inner.lock();
        if inner.state == BuilderState::Closed {
            return BuildStatus::NotBuilding;
        }
        match self.shared.merge_locked(&mut inner, optimize, current_ts) {
            Ok(Some(_)) => BuildStatus::Ok,
            Ok(None) => BuildStatus::NoNeed,
            Err(e) => {
                error!(error = %e, "merge failed");
                BuildStatus::from(&e)
            }
        }
    }

    /// Runs one memory-control pass on the calling thread.
    pub fn execute_build_memory_control(&self) -> CoreResult<()> {
        self.shared.execute_build_memory_control()
    }

    /// Stops background tasks and releases the partition.
    ///
    /// Documents not committed by `end_index` are discarded.
    pub fn close(&self) -> BuildStatus {
        if let Err(e) = self.tasks.lock().stop_all() {
            warn!(error = %e, "background task failed to stop");
        }
        self.shared.dump_queue.clear_notifier();
        let mut inner = self.shared.inner.lock();
        if inner.state == BuilderState::Closed {
            return BuildStatus::NoNeed;
        }
        if inner.writer.has_uncommitted() {
            warn!(
                building_docs = inner.writer.data().building().map_or(0, |b| b.live_count()),
                pending_segments = inner.writer.data().pending_segments().len(),
                "closing builder with uncommitted documents"
            );
        }
        inner.state = BuilderState::Closed;
        drop(inner);
        #[cfg(feature = "std")]
        self.lock.lock().take();
        info!("index builder closed");
        BuildStatus::Ok
    }

    /// Returns the builder state.
    #[must_use]
    pub fn state(&self) -> BuilderState {
        self.shared.inner.lock().state
    }

    /// Returns the latest version the builder committed or started from.
    #[must_use]
    pub fn version(&self) -> Arc<Version> {
        self.shared.version()
    }

    /// Returns the build counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<CounterMap> {
        &self.shared.counters
    }

    /// Memory held by the building segment and queued dumps.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        self.shared.inner.lock().writer.total_memory()
    }

    /// Returns the directory the builder writes into.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.shared.dir
    }

    /// Returns the partition root.
    #[must_use]
    pub fn root(&self) -> &Arc<dyn Directory> {
        &self.shared.root
    }
}

impl Drop for IndexBuilder {
    fn drop(&mut self) {
        if let Err(e) = self.tasks.get_mut().stop_all() {
            warn!(error = %e, "background task failed to stop");
        }
    }
}

impl BuilderShared {
    fn version(&self) -> Arc<Version> {
        Arc::clone(self.inner.lock().writer.data().version())
    }

    fn free_quota(&self) -> u64 {
        self.config
            .build_total_memory
            .saturating_sub(self.dump_queue.pending_memory())
    }

    fn skip(&self, reason: &str, pk: &str) {
        self.counters.acc(names::SKIP_DOC_COUNT).increment(1);
        debug!(pk, reason, "document skipped");
    }

    fn build(&self, doc: Document) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BuilderState::Building => {}
            BuilderState::Ended if self.ctx.strategy().accepts_streaming_build(self.ctx.schema()) => {
                debug!("resuming build after end index");
                inner.state = BuilderState::Building;
            }
            _ => {
                let e = CoreError::NotBuilding;
                warn!(pk = %doc.pk, error = %e, "document dropped");
                self.skip("not building", &doc.pk);
                return false;
            }
        }

        let pk = doc.pk.clone();
        let doc = match self.ctx.strategy().rewrite(self.ctx.schema(), doc) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                self.skip("nothing to apply", &pk);
                return false;
            }
            Err(e) => {
                warn!(pk = %pk, error = %e, "document rejected");
                self.skip("rejected", &pk);
                return false;
            }
        };

        if let Err(e) = self.commit_dumped(&mut inner) {
            warn!(error = %e, "failed to commit dumped segments");
        }

        if inner.batcher.is_some() {
            let estimate = inner.writer.estimate_doc_memory(&doc);
            let free = self.free_quota();
            let flush = inner.batcher.as_mut().is_some_and(|batcher| {
                batcher.push(doc, estimate);
                batcher.should_flush(free)
            });
            if flush {
                self.flush_batch(&mut inner);
            }
            return true;
        }
        self.admit(&mut inner, doc)
    }

    fn flush_batch(&self, inner: &mut BuilderInner) -> usize {
        let docs = inner.batcher.as_mut().map(DocumentBatcher::take).unwrap_or_default();
        if docs.is_empty() {
            return 0;
        }
        self.counters.acc(names::BATCH_FLUSH_COUNT).increment(1);
        docs.into_iter().map(|doc| self.admit(inner, doc)).filter(|ok| *ok).count()
    }

    /// Applies one document, dumping before or after it as memory requires.
    fn admit(&self, inner: &mut BuilderInner, doc: Document) -> bool {
        let estimate = inner.writer.estimate_doc_memory(&doc);
        if !inner.writer.is_building_empty() && inner.writer.building_memory() + estimate > self.free_quota() {
            if let Err(e) = self.dump(inner) {
                error!(pk = %doc.pk, error = %e, "dump before build failed");
                self.skip("dump failed", &doc.pk);
                return false;
            }
        }

        match inner.writer.add_document(&doc) {
            Ok(_) => {}
            Err(CoreError::OutOfMemory { segment_id }) => {
                debug!(pk = %doc.pk, segment_id, "building segment full, dumping and retrying");
                self.counters.acc(names::RETRY_DOC_COUNT).increment(1);
                let retried = self
                    .dump(inner)
                    .and_then(|()| inner.writer.add_document(&doc).map(|_| ()));
                if let Err(e) = retried {
                    error!(pk = %doc.pk, error = %e, "document dropped after retry");
                    self.skip("retry failed", &doc.pk);
                    return false;
                }
            }
            Err(e) => {
                warn!(pk = %doc.pk, error = %e, "document dropped");
                self.skip("build failed", &doc.pk);
                return false;
            }
        }

        if inner.writer.building_memory() > self.free_quota() {
            if let Err(e) = self.dump(inner) {
                warn!(error = %e, "dump after build failed");
            }
        }
        self.counters
            .state(names::BUILD_MEMORY_USE)
            .set(inner.writer.total_memory() as i64);
        true
    }

    /// Dumps the building segment; without async dump also commits it.
    fn dump(&self, inner: &mut BuilderInner) -> CoreResult<()> {
        inner.writer.dump_segment()?;
        if !self.dump_queue.is_async() {
            inner.writer.commit_pending(&self.store, INVALID_TIMESTAMP)?;
        }
        Ok(())
    }

    /// Commits segments the async dump task finished.
    fn commit_dumped(&self, inner: &mut BuilderInner) -> CoreResult<()> {
        if !self.dump_queue.has_completed() {
            return Ok(());
        }
        inner.writer.collect_dumped();
        if inner.writer.pending_flushed() {
            inner.writer.commit_pending(&self.store, INVALID_TIMESTAMP)?;
        }
        Ok(())
    }

    fn end_index(&self, timestamp: Timestamp) -> CoreResult<BuildStatus> {
        let mut inner = self.inner.lock();
        match inner.state {
            BuilderState::Closed => return Ok(BuildStatus::NotBuilding),
            BuilderState::Ended if !inner.writer.has_uncommitted() => return Ok(BuildStatus::NoNeed),
            _ => {}
        }
        self.flush_batch(&mut inner);
        let committed = inner.writer.commit_version(&self.store, timestamp)?;
        let mut merged = false;
        if self.config.merge_on_end_index && self.config.parallel.is_none() {
            merged = self.merge_locked(&mut inner, false, timestamp)?.is_some();
        }
        inner.state = BuilderState::Ended;
        info!(
            version = %inner.writer.data().version().id(),
            committed = committed.is_some(),
            merged,
            "end index"
        );
        Ok(if committed.is_some() || merged {
            BuildStatus::Ok
        } else {
            BuildStatus::NoNeed
        })
    }

    fn merge_locked(&self, inner: &mut BuilderInner, optimize: bool, timestamp: Timestamp) -> CoreResult<Option<Arc<Version>>> {
        if self.config.parallel.is_some() {
            return Err(CoreError::not_supported(
                "parallel shards are merged by the parallel partition merger",
            ));
        }
        self.flush_batch(inner);
        inner.writer.commit_version(&self.store, INVALID_TIMESTAMP)?;

        let merger = self.ctx.create_merger(
            Arc::clone(&self.dir),
            self.config.merge.clone(),
            self.config.keep_version_count,
            Arc::clone(&self.counters),
        );
        let Some(version) = merger.merge(optimize, timestamp)? else {
            return Ok(None);
        };
        // The merge target took a fresh id; a new writer allocates past it.
        inner.writer = self.ctx.create_writer(
            Arc::clone(&self.dir),
            PartitionData::unloaded(version.as_ref().clone()),
            &self.config,
            Arc::clone(&self.dump_queue),
            Arc::clone(&self.counters),
        )?;
        Ok(Some(version))
    }

    fn execute_build_memory_control(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != BuilderState::Building {
            return Ok(());
        }
        self.commit_dumped(&mut inner)?;
        if inner.batcher.as_ref().is_some_and(DocumentBatcher::is_expired) {
            self.flush_batch(&mut inner);
        }

        let total = inner.writer.total_memory();
        self.counters.state(names::BUILD_MEMORY_USE).set(total as i64);
        if total > self.config.build_total_memory && !self.dump_queue.is_empty() {
            self.counters.acc(names::FORCE_DUMP_COUNT).increment(1);
            info!(
                memory = total,
                budget = self.config.build_total_memory,
                queued = self.dump_queue.len(),
                "forcing queued dumps"
            );
            self.dump_queue.drain()?;
            inner.writer.collect_dumped();
            inner.writer.commit_pending(&self.store, INVALID_TIMESTAMP)?;
        }
        Ok(())
    }
}
