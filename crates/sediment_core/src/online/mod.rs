//! Serving a partition while it keeps changing.
//!
//! An [`OnlinePartition`] publishes readers over the incremental versions an
//! offline builder commits, plus the real-time documents it builds itself.
//! `reopen` moves it to a newer incremental version:
//!
//! 1. the [`ReopenDecider`] picks the [`ReopenType`]
//! 2. a prepare chain mounts the new segments and builds the new overlay
//!    without blocking builds
//! 3. a critical chain, under the cleaner and data locks, redoes the last
//!    real-time operations, switches the writer and publishes the reader
//!
//! A failed normal reopen that ran out of memory or time degrades to a force
//! reopen. A failed force reopen may fall back to a cold open that discards
//! every real-time document; that path is counted and logged. Any other
//! failure leaves the previous reader published.

mod cleaner;
mod decider;
mod executor;
mod redo;

pub use cleaner::CleanStats;
pub use decider::{ReopenDecider, ReopenInput, ReopenType};
pub use redo::{OperationRedoer, RedoBudget, RedoCursor};

use crate::background::{BackgroundTask, TaskGroup, TaskMessage};
use crate::builder::{DumpQueue, PartitionWriter, WriterMode};
use crate::config::OnlineConfig;
use crate::context::EngineContext;
use crate::counter::{names, CounterMap};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::partition_data::PartitionData;
use crate::reader::{PartitionReader, ReaderContainer};
use crate::segment::{SegmentArena, SegmentInfo};
use crate::status::{OpenStatus, ReopenStatus};
use crate::types::{SegmentId, VersionId};
use crate::version::{Version, VersionStore};
use cleaner::ResourceCleaner;
use executor::{ExecutorChain, ReopenContext, ReopenState};
use parking_lot::{Mutex, RwLock};
use sediment_storage::Directory;
use std::collections::HashSet;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where an online partition is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    /// Created, not opened yet.
    Pending,
    /// Loading its first version.
    Opening,
    /// Open and serving; no reopen is running.
    Serving,
    /// Running a normal reopen.
    NormalReopen,
    /// Running a force reopen.
    ForceReopen,
    /// Switching the reader to dumped real-time segments.
    SwitchFlushRt,
    /// Dumping real-time memory and rebuilding the reader.
    ReclaimReaderMem,
    /// Reopening cold after discarding real-time state.
    ReopenRt,
    /// Closed.
    Closed,
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Opening => "opening",
            Self::Serving => "serving",
            Self::NormalReopen => "normal_reopen",
            Self::ForceReopen => "force_reopen",
            Self::SwitchFlushRt => "switch_flush_rt",
            Self::ReclaimReaderMem => "reclaim_reader_mem",
            Self::ReopenRt => "reopen_rt",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Bytes the given segments of `dir` hold once loaded.
pub(crate) fn segment_bytes(dir: &dyn Directory, ids: &[SegmentId]) -> CoreResult<u64> {
    ids.iter()
        .map(|id| SegmentInfo::load(dir, *id).map(|info| info.byte_size))
        .sum()
}

/// State shared by the partition handle and its background tasks.
///
/// Lock order: `reopen_lock`, then `cleaner_lock`, then `data`. The arena,
/// reader and container locks are leaves.
#[derive(Debug)]
struct OnlineShared {
    ctx: Arc<EngineContext>,
    config: OnlineConfig,
    inc_dir: Arc<dyn Directory>,
    rt_dir: Arc<dyn Directory>,
    inc_store: VersionStore,
    reopen_lock: Mutex<()>,
    cleaner_lock: Mutex<()>,
    data: Mutex<Option<PartitionWriter>>,
    reader: RwLock<Option<Arc<PartitionReader>>>,
    container: ReaderContainer,
    arena: Mutex<SegmentArena>,
    dump_queue: Arc<DumpQueue>,
    counters: Arc<CounterMap>,
    status: Mutex<PartitionStatus>,
    cleaner_notifier: Mutex<Option<Sender<TaskMessage>>>,
}

/// A partition serving readers while building real-time documents.
#[derive(Debug)]
pub struct OnlinePartition {
    shared: Arc<OnlineShared>,
    tasks: Mutex<TaskGroup>,
}

const CLEANER_TASK: &str = "cleaner";
const REPORT_TASK: &str = "report";
const MEMORY_CONTROL_TASK: &str = "rt-memory-control";
const ASYNC_DUMP_TASK: &str = "rt-async-dump";

impl OnlinePartition {
    /// Creates a partition over the incremental directory `inc_dir`, keeping
    /// real-time segments in `rt_dir`. Nothing is loaded until [`Self::open`].
    pub fn new(ctx: Arc<EngineContext>, config: OnlineConfig, inc_dir: Arc<dyn Directory>, rt_dir: Arc<dyn Directory>) -> Self {
        let shared = OnlineShared {
            ctx,
            inc_store: VersionStore::new(Arc::clone(&inc_dir)),
            container: ReaderContainer::new(config.reader_container_capacity),
            config,
            inc_dir,
            rt_dir,
            reopen_lock: Mutex::new(()),
            cleaner_lock: Mutex::new(()),
            data: Mutex::new(None),
            reader: RwLock::new(None),
            arena: Mutex::new(SegmentArena::new()),
            dump_queue: Arc::new(DumpQueue::new()),
            counters: Arc::new(CounterMap::new()),
            status: Mutex::new(PartitionStatus::Pending),
            cleaner_notifier: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            tasks: Mutex::new(TaskGroup::new()),
        }
    }

    /// Loads `target` (the latest version when `None`, an empty partition
    /// when the directory has none) and publishes the first reader.
    pub fn open(&self, target: Option<VersionId>) -> OpenStatus {
        let started = Instant::now();
        let opened = {
            let _serial = self.shared.reopen_lock.lock();
            {
                let mut status = self.shared.status.lock();
                if *status != PartitionStatus::Pending {
                    warn!(status = %*status, "open called on a partition that is not pending");
                    return OpenStatus::Fail;
                }
                *status = PartitionStatus::Opening;
            }
            self.shared.open_version(target).and_then(|version| {
                self.spawn_tasks()?;
                self.shared.set_status(PartitionStatus::Serving);
                Ok(version)
            })
        };
        match opened {
            Ok(version) => {
                info!(
                    version = %version,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "online partition opened"
                );
                OpenStatus::Ok
            }
            Err(e) => {
                error!(target = ?target, error = %e, "online partition open failed");
                // Tasks may be waiting on the reopen lock, so they are joined after it is released.
                self.stop_tasks();
                self.shared.reset();
                self.shared.set_status(PartitionStatus::Pending);
                OpenStatus::from(&e)
            }
        }
    }

    fn spawn_tasks(&self) -> CoreResult<()> {
        let config = &self.shared.config;
        if !config.enable_background_tasks {
            return Ok(());
        }
        let mut tasks = self.tasks.lock();
        if config.build.enable_async_dump {
            let queue = Arc::clone(&self.shared.dump_queue);
            let task = BackgroundTask::spawn_periodic(ASYNC_DUMP_TASK, config.build.memory_control_interval(), move || {
                queue.flush().map(|_| ())
            })?;
            self.shared.dump_queue.set_notifier(task.notifier());
            tasks.push(task);
        }

        let shared = Arc::clone(&self.shared);
        let cleaner = BackgroundTask::spawn_periodic(CLEANER_TASK, config.cleaner_interval(), move || {
            shared.clean().map(|_| ())
        })?;
        *self.shared.cleaner_notifier.lock() = Some(cleaner.notifier());
        tasks.push(cleaner);

        let shared = Arc::clone(&self.shared);
        tasks.push(BackgroundTask::spawn_periodic(REPORT_TASK, config.report_interval(), move || {
            shared.report();
            Ok(())
        })?);

        let shared = Arc::clone(&self.shared);
        tasks.push(BackgroundTask::spawn_periodic(
            MEMORY_CONTROL_TASK,
            config.build.memory_control_interval(),
            move || shared.execute_memory_control(),
        )?);
        Ok(())
    }

    fn stop_tasks(&self) {
        *self.shared.cleaner_notifier.lock() = None;
        self.shared.dump_queue.clear_notifier();
        if let Err(e) = self.tasks.lock().stop_all() {
            warn!(error = %e, "background task failed to stop");
        }
    }

    /// Moves the partition to `target` (the latest version when `None`).
    ///
    /// With `force` the target is reloaded from scratch even if it could be
    /// applied incrementally.
    pub fn reopen(&self, force: bool, target: Option<VersionId>) -> ReopenStatus {
        self.shared.reopen(force, target)
    }

    /// Builds a real-time document.
    ///
    /// Returns false if the document was not applied: the partition is not
    /// open, the table rejected it, or the loaded version already covers its
    /// locator.
    pub fn build(&self, doc: Document) -> bool {
        self.shared.build(doc)
    }

    /// Returns the published reader.
    #[must_use]
    pub fn reader(&self) -> Option<Arc<PartitionReader>> {
        self.shared.reader()
    }

    /// Returns the version the published reader is built on.
    #[must_use]
    pub fn version(&self) -> Option<Arc<Version>> {
        self.shared.reader().map(|r| Arc::clone(r.data().version()))
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> PartitionStatus {
        *self.shared.status.lock()
    }

    /// Returns the partition counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<CounterMap> {
        &self.shared.counters
    }

    /// Returns the reader container.
    #[must_use]
    pub fn readers(&self) -> &ReaderContainer {
        &self.shared.container
    }

    /// Runs one cleaner pass on the calling thread.
    pub fn execute_clean(&self) -> CoreResult<CleanStats> {
        self.shared.clean()
    }

    /// Runs one memory-control pass on the calling thread: switches to
    /// dumped real-time segments, or dumps them when over the reclaim threshold.
    pub fn execute_memory_control(&self) -> CoreResult<()> {
        self.shared.execute_memory_control()
    }

    /// Stops background tasks and drops every reader and real-time document.
    pub fn close(&self) -> OpenStatus {
        if self.status() == PartitionStatus::Closed {
            return OpenStatus::Ok;
        }
        self.stop_tasks();
        let _serial = self.shared.reopen_lock.lock();
        let discarded = self.shared.reset();
        self.shared.set_status(PartitionStatus::Closed);
        info!(discarded_operations = discarded, "online partition closed");
        OpenStatus::Ok
    }
}

impl Drop for OnlinePartition {
    fn drop(&mut self) {
        *self.shared.cleaner_notifier.lock() = None;
        if let Err(e) = self.tasks.get_mut().stop_all() {
            warn!(error = %e, "background task failed to stop");
        }
    }
}

impl OnlineShared {
    fn set_status(&self, status: PartitionStatus) {
        *self.status.lock() = status;
    }

    fn is_serving(&self) -> bool {
        !matches!(
            *self.status.lock(),
            PartitionStatus::Pending | PartitionStatus::Opening | PartitionStatus::Closed
        )
    }

    fn reader(&self) -> Option<Arc<PartitionReader>> {
        self.reader.read().clone()
    }

    fn loaded_version(&self) -> CoreResult<Arc<Version>> {
        self.reader()
            .map(|r| Arc::clone(r.data().version()))
            .ok_or_else(|| CoreError::closed("online partition"))
    }

    /// Clones the writer's current data.
    fn writer_snapshot(&self) -> CoreResult<PartitionData> {
        self.data
            .lock()
            .as_ref()
            .map(|writer| writer.data().clone())
            .ok_or_else(|| CoreError::closed("online partition"))
    }

    fn publish(&self, reader: Arc<PartitionReader>) {
        debug!(
            version = %reader.version_id(),
            segments = reader.segment_ids().len(),
            "publishing reader"
        );
        *self.reader.write() = Some(Arc::clone(&reader));
        self.container.add(reader);
        self.counters.state(names::READER_COUNT).set(self.container.len() as i64);
    }

    /// Wakes the cleaner task. Returns false if it is not running.
    fn trigger_cleaner(&self) -> bool {
        self.cleaner_notifier
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(TaskMessage::Trigger).is_ok())
    }

    /// Drops the writer and every reader. Returns the discarded operation count.
    fn reset(&self) -> usize {
        let _cleaner = self.cleaner_lock.lock();
        let writer = self.data.lock().take();
        *self.reader.write() = None;
        self.container.clear();
        writer.map_or(0, |w| discarded_operations(w.data()))
    }

    fn open_version(&self, target: Option<VersionId>) -> CoreResult<VersionId> {
        let version = match target {
            Some(id) => self.inc_store.load(id)?,
            None => self.inc_store.load_or_empty(None)?,
        };
        let required = segment_bytes(self.inc_dir.as_ref(), version.segments())?;
        let available = self.config.max_reopen_memory_use;
        if required > available {
            return Err(CoreError::LackOfMemory { required, available });
        }
        let id = version.id();
        let (writer, reader) = self.load_cold(Arc::new(version))?;

        let _cleaner = self.cleaner_lock.lock();
        *self.data.lock() = Some(writer);
        self.publish(reader);
        Ok(id)
    }

    /// Loads `version` with no real-time state.
    fn load_cold(&self, version: Arc<Version>) -> CoreResult<(PartitionWriter, Arc<PartitionReader>)> {
        let data = {
            let mut arena = self.arena.lock();
            PartitionData::load(self.inc_dir.as_ref(), version, &mut arena)?
        };
        let reader = Arc::new(PartitionReader::open(data.clone()));
        let mut writer = PartitionWriter::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.rt_dir),
            data,
            &self.config.build,
            WriterMode::Realtime,
            Arc::clone(&self.dump_queue),
            Arc::clone(&self.counters),
        )?;
        writer.set_overlay(Some(Arc::clone(reader.overlay())));
        Ok((writer, reader))
    }

    fn skip(&self, pk: &str, reason: &str) -> bool {
        self.counters.acc(names::ONLINE_SKIP_DOC_COUNT).increment(1);
        debug!(pk, reason, "real-time document skipped");
        false
    }

    fn build(&self, doc: Document) -> bool {
        if !self.is_serving() {
            return self.skip(&doc.pk, "partition not open");
        }
        let pk = doc.pk.clone();
        let doc = match self.ctx.strategy().rewrite(self.ctx.schema(), doc) {
            Ok(Some(doc)) => doc,
            Ok(None) => return self.skip(&pk, "nothing to apply"),
            Err(e) => {
                warn!(pk = %pk, error = %e, "real-time document rejected");
                return self.skip(&pk, "rejected");
            }
        };

        let mut guard = self.data.lock();
        let Some(writer) = guard.as_mut() else {
            return self.skip(&pk, "partition not open");
        };
        if writer.data().version().locator().covers(&doc.locator) {
            return self.skip(&pk, "covered by incremental version");
        }

        match writer.add_document(&doc) {
            Ok(_) => {}
            Err(CoreError::OutOfMemory { segment_id }) => {
                debug!(pk = %pk, segment_id, "real-time segment full, dumping and retrying");
                let retried = writer.dump_segment().and_then(|_| writer.add_document(&doc));
                if let Err(e) = retried {
                    error!(pk = %pk, error = %e, "real-time document dropped after retry");
                    return self.skip(&pk, "retry failed");
                }
            }
            Err(e) => {
                warn!(pk = %pk, error = %e, "real-time document dropped");
                return self.skip(&pk, "build failed");
            }
        }

        if writer.total_memory() > self.config.rt_memory_quota {
            if let Err(e) = writer.dump_segment() {
                warn!(error = %e, "real-time dump failed");
            }
        }
        self.counters
            .state(names::RT_MEMORY_USE)
            .set(writer.data().in_memory_use() as i64);
        self.refresh_reader(writer);
        true
    }

    /// Publishes a reader over the writer's data when its segment list changed.
    fn refresh_reader(&self, writer: &PartitionWriter) {
        let stale = self
            .reader()
            .map_or(true, |reader| reader.segment_ids() != writer.data().segment_ids());
        if stale {
            let overlay = writer.overlay().cloned().unwrap_or_default();
            self.publish(Arc::new(PartitionReader::new(writer.data().clone(), overlay)));
        }
    }

    fn reopen(&self, force: bool, target: Option<VersionId>) -> ReopenStatus {
        let _serial = self.reopen_lock.lock();
        if !self.is_serving() {
            warn!(status = %*self.status.lock(), "reopen called on a partition that is not open");
            return ReopenStatus::Fail;
        }
        let started = Instant::now();
        let status = match self.reopen_locked(force, target) {
            Ok(status) => status,
            Err(e) => {
                error!(target = ?target, error = %e, "reopen failed");
                ReopenStatus::Fail
            }
        };
        self.set_status(PartitionStatus::Serving);
        if matches!(status, ReopenStatus::Ok | ReopenStatus::ForceOpenFallback) {
            self.counters.acc(names::REOPEN_COUNT).increment(1);
        }
        if status != ReopenStatus::NoNeed {
            info!(
                %status,
                version = ?self.reader().map(|r| r.version_id()),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "reopen finished"
            );
        }
        status
    }

    fn reopen_locked(&self, force: bool, target: Option<VersionId>) -> CoreResult<ReopenStatus> {
        let loaded = self.loaded_version()?;
        let target = match target {
            Some(id) if id == loaded.id() => Some(Arc::clone(&loaded)),
            Some(id) => match self.inc_store.load(id) {
                Ok(version) => Some(Arc::new(version)),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => Some(
                self.inc_store
                    .load_latest()?
                    .map_or_else(|| Arc::clone(&loaded), Arc::new),
            ),
        };
        let target_bytes = match &target {
            Some(t) if t.id() != loaded.id() => segment_bytes(self.inc_dir.as_ref(), t.segments())?,
            _ => 0,
        };
        let (rt_memory, rt_flushed) = self.rt_state()?;

        let decision = ReopenDecider::new(&self.config).decide(&ReopenInput {
            loaded: &loaded,
            target: target.as_deref(),
            force,
            rt_memory,
            rt_flushed,
            target_bytes,
        });
        let target = match (decision, target) {
            (ReopenType::NoNeed, _) => return Ok(ReopenStatus::NoNeed),
            (ReopenType::Invalid, _) | (_, None) => return Ok(ReopenStatus::Invalid),
            (ReopenType::UnableNormal | ReopenType::UnableForce, _) => {
                warn!(%decision, target_bytes, budget = self.config.max_reopen_memory_use, "reopen rejected");
                return Ok(ReopenStatus::Unable);
            }
            (_, Some(target)) => target,
        };

        match decision {
            ReopenType::SwitchRtSegment => {
                self.set_status(PartitionStatus::SwitchFlushRt);
                self.run_critical(&ExecutorChain::switch_rt(), ReopenState::new(target))?;
                Ok(ReopenStatus::Ok)
            }
            ReopenType::ReclaimReader => {
                self.set_status(PartitionStatus::ReclaimReaderMem);
                self.run_critical(&ExecutorChain::reclaim(), ReopenState::new(target))?;
                Ok(ReopenStatus::Ok)
            }
            ReopenType::Normal => {
                self.set_status(PartitionStatus::NormalReopen);
                match self.run_reopen(ReopenType::Normal, Arc::clone(&target)) {
                    Ok(()) => Ok(ReopenStatus::Ok),
                    Err(e) if e.is_budget_exhausted() => {
                        warn!(error = %e, "normal reopen over budget, falling back to force reopen");
                        self.counters.acc(names::REOPEN_FALLBACK_COUNT).increment(1);
                        Ok(self.force_reopen(target))
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(self.force_reopen(target)),
        }
    }

    /// Memory of in-memory real-time segments, and whether dumped segments
    /// are waiting to replace their in-memory copies in the reader.
    fn rt_state(&self) -> CoreResult<(u64, bool)> {
        let guard = self.data.lock();
        let writer = guard.as_ref().ok_or_else(|| CoreError::closed("online partition"))?;
        let rt_memory = writer.data().in_memory_use();
        let built: HashSet<SegmentId> = writer
            .data()
            .pending_segments()
            .iter()
            .filter(|h| !h.is_in_memory())
            .map(|h| h.id())
            .collect();
        let reader_stale = self.reader().is_some_and(|reader| {
            reader
                .data()
                .writer_segments()
                .iter()
                .any(|h| h.is_in_memory() && built.contains(&h.id()))
        });
        Ok((rt_memory, reader_stale || self.dump_queue.has_completed()))
    }

    fn force_reopen(&self, target: Arc<Version>) -> ReopenStatus {
        self.set_status(PartitionStatus::ForceReopen);
        let err = match self.run_reopen(ReopenType::Force, Arc::clone(&target)) {
            Ok(()) => return ReopenStatus::Ok,
            Err(e) => e,
        };
        if !self.config.enable_force_open {
            error!(error = %err, "force reopen failed");
            return ReopenStatus::Fail;
        }
        warn!(error = %err, "force reopen failed, reopening without real-time data");
        self.set_status(PartitionStatus::ReopenRt);
        match self.cold_reopen(target) {
            Ok(discarded) => {
                self.counters
                    .acc(names::DISCARDED_OPERATION_COUNT)
                    .increment(discarded as i64);
                warn!(discarded_operations = discarded, "real-time data discarded by force open");
                ReopenStatus::ForceOpenFallback
            }
            Err(e) => {
                error!(error = %e, "force open failed, keeping the previous reader");
                ReopenStatus::Fail
            }
        }
    }

    /// Replaces all state by a cold load of `target`.
    ///
    /// The old writer and reader stay in place until the load succeeded.
    fn cold_reopen(&self, target: Arc<Version>) -> CoreResult<usize> {
        let (writer, reader) = self.load_cold(target)?;
        let _cleaner = self.cleaner_lock.lock();
        let mut guard = self.data.lock();
        let discarded = guard.as_ref().map_or(0, |w| discarded_operations(w.data()));
        *guard = Some(writer);
        self.publish(reader);
        Ok(discarded)
    }

    fn run_reopen(&self, kind: ReopenType, target: Arc<Version>) -> CoreResult<()> {
        let (prepare, critical) = ExecutorChain::reopen(kind);
        let mut ctx = ReopenContext {
            shared: self,
            state: ReopenState::new(target),
            writer: None,
        };
        prepare.run(&mut ctx)?;
        self.run_critical(&critical, ctx.state)
    }

    fn run_critical(&self, chain: &ExecutorChain, state: ReopenState) -> CoreResult<()> {
        let _cleaner = self.cleaner_lock.lock();
        let mut guard = self.data.lock();
        let writer = guard.as_mut().ok_or_else(|| CoreError::closed("online partition"))?;
        let mut ctx = ReopenContext {
            shared: self,
            state,
            writer: Some(writer),
        };
        chain.run(&mut ctx)
    }

    fn clean(&self) -> CoreResult<CleanStats> {
        let _cleaner = self.cleaner_lock.lock();
        let guard = self.data.lock();
        let writer_segments: HashSet<SegmentId> = guard
            .as_ref()
            .map(|w| w.data().segment_ids().into_iter().collect())
            .unwrap_or_default();
        let cleaner = ResourceCleaner {
            container: &self.container,
            arena: &self.arena,
            rt_dir: self.rt_dir.as_ref(),
            counters: &self.counters,
        };
        let stats = cleaner.clean(&writer_segments, &self.dump_queue.pending_ids())?;
        self.counters.state(names::READER_COUNT).set(self.container.len() as i64);
        Ok(stats)
    }

    fn report(&self) {
        self.counters
            .state(names::READER_MEMORY_USE)
            .set(self.container.memory_use() as i64);
        self.counters.state(names::READER_COUNT).set(self.container.len() as i64);
        if let Some(writer) = self.data.lock().as_ref() {
            self.counters
                .state(names::RT_MEMORY_USE)
                .set(writer.data().in_memory_use() as i64);
        }
        debug!(counters = %self.counters.to_json(), "online partition report");
    }

    fn execute_memory_control(&self) -> CoreResult<()> {
        if !self.is_serving() {
            return Ok(());
        }
        let loaded = self.loaded_version()?;
        match self.reopen(false, Some(loaded.id())) {
            ReopenStatus::Ok | ReopenStatus::NoNeed => Ok(()),
            status => Err(CoreError::inconsistent(format!(
                "memory control reopen finished with {status}"
            ))),
        }
    }
}

fn discarded_operations(data: &PartitionData) -> usize {
    data.writer_segments().iter().map(|h| h.operation_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IndexBuilder;
    use crate::config::BuildConfig;
    use crate::context::Schema;
    use crate::locator::Locator;
    use crate::segment::DATA_FILE;
    use crate::types::INVALID_TIMESTAMP;
    use sediment_storage::InMemoryDirectory;

    fn ctx() -> Arc<EngineContext> {
        Arc::new(EngineContext::normal(Schema::new("t")))
    }

    fn offline(dir: &Arc<dyn Directory>) -> IndexBuilder {
        IndexBuilder::open(
            ctx(),
            Arc::clone(dir),
            BuildConfig::default().enable_background_tasks(false),
        )
        .unwrap()
    }

    fn at(doc: Document, offset: i64) -> Document {
        doc.with_locator(Locator::new(1, offset))
    }

    fn config() -> OnlineConfig {
        OnlineConfig::default().enable_background_tasks(false)
    }

    fn partition(inc: &Arc<dyn Directory>, config: OnlineConfig) -> (OnlinePartition, Arc<dyn Directory>) {
        let rt: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let partition = OnlinePartition::new(ctx(), config, Arc::clone(inc), Arc::clone(&rt));
        (partition, rt)
    }

    #[test]
    fn opens_empty_directory() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let (partition, _) = partition(&inc, config());
        assert_eq!(partition.status(), PartitionStatus::Pending);
        assert_eq!(partition.open(None), OpenStatus::Ok);
        assert_eq!(partition.status(), PartitionStatus::Serving);
        assert_eq!(partition.version().unwrap().id(), VersionId::INITIAL);
        assert_eq!(partition.open(None), OpenStatus::Fail);
    }

    #[test]
    fn missing_target_fails_open() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let (partition, _) = partition(&inc, config());
        assert_eq!(partition.open(Some(VersionId::new(4))), OpenStatus::Fail);
        assert_eq!(partition.status(), PartitionStatus::Pending);
        assert!(partition.reader().is_none());
    }

    #[test]
    fn open_over_budget_is_lack_of_memory() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("a").field("f", "x"), 1));
        builder.end_index(1);

        let (partition, _) = partition(&inc, config().max_reopen_memory_use(1));
        assert_eq!(partition.open(None), OpenStatus::LackOfMemory);
    }

    #[test]
    fn realtime_documents_are_visible() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let (partition, _) = partition(&inc, config());
        partition.open(None);

        assert!(partition.build(at(Document::add("a").field("f", "1"), 1)));
        let reader = partition.reader().unwrap();
        assert_eq!(reader.lookup("a").unwrap().fields["f"], "1");

        assert!(partition.build(at(Document::update("a").field("f", "2"), 2)));
        assert_eq!(reader.lookup("a").unwrap().fields["f"], "2");
        assert_eq!(partition.counters().value(names::ONLINE_BUILD_DOC_COUNT), Some(2));
    }

    #[test]
    fn covered_documents_are_skipped() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("a"), 10));
        builder.end_index(1);

        let (partition, _) = partition(&inc, config());
        partition.open(None);
        assert!(!partition.build(at(Document::add("b"), 7)));
        assert!(partition.build(at(Document::add("c"), 11)));
        assert_eq!(partition.counters().value(names::ONLINE_SKIP_DOC_COUNT), Some(1));
    }

    #[test]
    fn normal_reopen_redoes_realtime_updates_once() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("x").field("f", "0"), 100));
        builder.end_index(1);

        let (partition, _) = partition(&inc, config());
        partition.open(None);
        partition.build(at(Document::update("x").field("a", "105"), 105));
        partition.build(at(Document::update("x").field("b", "110"), 110));
        let old_reader = partition.reader().unwrap();

        builder.build(at(Document::add("y"), 102));
        builder.end_index(2);
        assert_eq!(partition.reopen(false, None), ReopenStatus::Ok);

        let reader = partition.reader().unwrap();
        assert_eq!(reader.version_id(), VersionId::new(2));
        let x = reader.lookup("x").unwrap();
        assert_eq!(x.fields["a"], "105");
        assert_eq!(x.fields["b"], "110");
        assert!(reader.lookup("y").is_some());
        assert_eq!(partition.counters().value(names::REDO_OPERATION_COUNT), Some(2));

        assert_eq!(old_reader.version_id(), VersionId::new(1));
        assert!(old_reader.lookup("y").is_none());
    }

    #[test]
    fn covered_realtime_documents_yield_to_the_version() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("a").field("v", "inc"), 1));
        builder.end_index(1);

        let (partition, _) = partition(&inc, config());
        partition.open(None);
        partition.build(at(Document::add("b").field("v", "rt"), 5));

        builder.build(at(Document::add("b").field("v", "inc"), 5));
        builder.end_index(2);
        assert_eq!(partition.reopen(false, None), ReopenStatus::Ok);

        let reader = partition.reader().unwrap();
        assert_eq!(reader.lookup("b").unwrap().fields["v"], "inc");
        assert_eq!(reader.doc_count(), 2);
        assert_eq!(partition.counters().value(names::REDO_SKIP_COUNT), Some(1));
    }

    #[test]
    fn realtime_update_of_covered_add_moves_to_the_version() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("x"), 1));
        builder.end_index(1);

        let (partition, _) = partition(&inc, config());
        partition.open(None);
        assert!(partition.build(at(Document::add("a").field("f", "rt"), 12)));
        assert!(partition.build(at(Document::update("a").field("f", "u"), 15)));

        builder.build(at(Document::add("a").field("f", "inc"), 12));
        builder.end_index(2);
        assert_eq!(partition.reopen(false, None), ReopenStatus::Ok);

        let reader = partition.reader().unwrap();
        assert_eq!(reader.doc_count(), 2);
        assert_eq!(reader.lookup("a").unwrap().fields["f"], "u");

        // The real-time copy stays hidden; later updates reach the versioned copy.
        assert!(partition.build(at(Document::update("a").field("g", "v"), 16)));
        let reader = partition.reader().unwrap();
        assert_eq!(reader.doc_count(), 2);
        let a = reader.lookup("a").unwrap();
        assert_eq!(a.fields["f"], "u");
        assert_eq!(a.fields["g"], "v");
    }

    #[test]
    fn same_version_needs_no_reopen() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let (partition, _) = partition(&inc, config());
        partition.open(None);
        assert_eq!(partition.reopen(false, None), ReopenStatus::NoNeed);
        assert_eq!(partition.reopen(false, Some(VersionId::new(9))), ReopenStatus::Invalid);
    }

    #[test]
    fn redo_timeout_falls_back_to_force() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("x"), 1));
        builder.end_index(1);

        let cfg = config().max_redo_time_ms(0).redo_catch_up_threshold(0);
        let (partition, _) = partition(&inc, cfg);
        partition.open(None);
        partition.build(at(Document::update("x").field("f", "rt"), 10));

        builder.build(at(Document::add("y"), 2));
        builder.end_index(2);
        assert_eq!(partition.reopen(false, None), ReopenStatus::Ok);
        assert_eq!(partition.counters().value(names::REOPEN_FALLBACK_COUNT), Some(1));
        assert_eq!(partition.reader().unwrap().lookup("x").unwrap().fields["f"], "rt");
    }

    #[test]
    fn failed_force_reopen_opens_cold() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("x"), 1));
        builder.end_index(1);
        builder.build(at(Document::add("y"), 2));
        builder.end_index(2);

        // The budget fits the target version but not its real-time data too.
        let target_bytes = segment_bytes(inc.as_ref(), builder.version().segments()).unwrap();
        let (partition, _) = partition(&inc, config().max_reopen_memory_use(target_bytes + 64));
        assert_eq!(partition.open(Some(VersionId::new(1))), OpenStatus::Ok);
        for i in 0..20 {
            assert!(partition.build(at(Document::add(format!("rt{i}")).field("payload", "p".repeat(100)), 10 + i)));
        }

        assert_eq!(partition.reopen(true, None), ReopenStatus::ForceOpenFallback);
        assert_eq!(partition.counters().value(names::DISCARDED_OPERATION_COUNT), Some(20));
        assert_eq!(partition.counters().value(names::REOPEN_COUNT), Some(1));
        let reader = partition.reader().unwrap();
        assert_eq!(reader.version_id(), VersionId::new(2));
        assert!(reader.lookup("rt0").is_none());
        assert!(reader.lookup("y").is_some());
        assert_eq!(partition.status(), PartitionStatus::Serving);
    }

    #[test]
    fn force_reopen_without_fallback_keeps_old_reader() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        builder.build(at(Document::add("x"), 1));
        builder.end_index(1);
        builder.build(at(Document::add("y"), 2));
        builder.end_index(2);

        let (partition, _) = partition(&inc, config().enable_force_open(false));
        partition.open(Some(VersionId::new(1)));

        // A version whose segment data is gone cannot be loaded.
        let added = builder.version().segments().last().copied().unwrap();
        inc.remove(&SegmentInfo::path(added, DATA_FILE)).unwrap();

        assert_eq!(partition.reopen(true, None), ReopenStatus::Fail);
        assert_eq!(partition.version().unwrap().id(), VersionId::new(1));
        assert_eq!(partition.status(), PartitionStatus::Serving);
    }

    #[test]
    fn full_realtime_segment_is_dumped_inline() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let build = BuildConfig::default().max_docs_per_segment(2);
        let (partition, rt) = partition(&inc, config().build(build));
        partition.open(None);
        for i in 0..3 {
            assert!(partition.build(at(Document::add(format!("d{i}")), i + 1)));
        }

        let first_rt = SegmentId::first_realtime();
        assert!(rt.exists(&first_rt.dir_name()));
        let reader = partition.reader().unwrap();
        assert!(!reader
            .data()
            .writer_segments()
            .iter()
            .any(|h| h.id() == first_rt && h.is_in_memory()));
        assert_eq!(reader.doc_count(), 3);
        assert_eq!(partition.reopen(false, None), ReopenStatus::NoNeed);
    }

    #[test]
    fn async_dumped_segments_switch_in() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let build = BuildConfig::default().max_docs_per_segment(1).enable_async_dump(true);
        let (partition, _) = partition(&inc, config().build(build));
        partition.open(None);
        partition.build(at(Document::add("a"), 1));
        partition.build(at(Document::add("b"), 2));

        let first_rt = SegmentId::first_realtime();
        let in_memory = |p: &OnlinePartition| {
            p.reader()
                .unwrap()
                .data()
                .writer_segments()
                .iter()
                .any(|h| h.id() == first_rt && h.is_in_memory())
        };
        assert!(in_memory(&partition));

        partition.shared.dump_queue.flush().unwrap();
        assert_eq!(partition.reopen(false, None), ReopenStatus::Ok);
        assert!(!in_memory(&partition));
        assert_eq!(partition.reader().unwrap().doc_count(), 2);
        assert_eq!(partition.reopen(false, None), ReopenStatus::NoNeed);
    }

    #[test]
    fn reclaim_dumps_realtime_memory() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let cfg = config().rt_memory_quota(10_000);
        let (partition, rt) = partition(&inc, OnlineConfig {
            reclaim_reader_memory_ratio: 0.0,
            ..cfg
        });
        partition.open(None);
        partition.build(at(Document::add("a"), 1));

        assert_eq!(partition.reopen(false, None), ReopenStatus::Ok);
        let reader = partition.reader().unwrap();
        assert!(reader.data().writer_segments().iter().all(|h| !h.is_in_memory()));
        assert!(rt.exists(&SegmentId::first_realtime().dir_name()));
        assert!(reader.lookup("a").is_some());
    }

    #[test]
    fn cleaner_removes_covered_rt_segments() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let builder = offline(&inc);
        let (partition, rt) = partition(&inc, config().rt_memory_quota(10_000).build(BuildConfig::default().max_docs_per_segment(1)));
        partition.open(None);
        partition.build(at(Document::add("a"), 1));
        partition.build(at(Document::add("b"), 2));
        let first_rt = SegmentId::first_realtime();
        assert!(rt.exists(&first_rt.dir_name()));

        builder.build(at(Document::add("a"), 1));
        builder.build(at(Document::add("b"), 2));
        builder.end_index(INVALID_TIMESTAMP);
        assert_eq!(partition.reopen(false, None), ReopenStatus::Ok);

        let stats = partition.execute_clean().unwrap();
        assert!(stats.removed_rt_segments.contains(&first_rt));
        assert_eq!(partition.reader().unwrap().doc_count(), 2);
    }

    #[test]
    fn closed_partition_rejects_work() {
        let inc: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let (partition, _) = partition(&inc, config());
        partition.open(None);
        partition.build(at(Document::add("a"), 1));
        assert_eq!(partition.close(), OpenStatus::Ok);
        assert_eq!(partition.status(), PartitionStatus::Closed);
        assert!(partition.reader().is_none());
        assert!(!partition.build(at(Document::add("b"), 2)));
        assert_eq!(partition.reopen(false, None), ReopenStatus::Fail);
    }
}
