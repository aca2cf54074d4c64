//! Reopen steps and the chains that run them.
//!
//! A reopen is split into a prepare chain, run without holding the data
//! lock, and a critical chain, run while holding the cleaner lock and the
//! data lock. Builds continue during the prepare chain; the critical chain
//! replays whatever they logged and swaps the writer and the reader over.
//! Nothing becomes visible before the critical chain succeeds, so a failed
//! reopen leaves the published reader untouched.

use super::redo::{OperationRedoer, RedoBudget};
use super::{segment_bytes, OnlineShared, ReopenType};
use crate::builder::PartitionWriter;
use crate::counter::names;
use crate::error::{CoreError, CoreResult};
use crate::partition_data::PartitionData;
use crate::reader::{PartitionReader, PatchLoader, PatchModifier, PatchOverlay};
use crate::segment::BuiltSegment;
use crate::version::Version;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything a reopen builds up before publishing.
#[derive(Debug)]
pub(super) struct ReopenState {
    pub(super) target: Arc<Version>,
    /// Target version with its segments mounted, without writer segments.
    pub(super) base: Option<PartitionData>,
    pub(super) data: Option<PartitionData>,
    pub(super) overlay: Option<Arc<PatchOverlay>>,
    pub(super) redoer: OperationRedoer,
}

impl ReopenState {
    pub(super) fn new(target: Arc<Version>) -> Self {
        let covered_by = target.locator();
        Self {
            target,
            base: None,
            data: None,
            overlay: None,
            redoer: OperationRedoer::new(covered_by),
        }
    }

    fn base(&self) -> CoreResult<&PartitionData> {
        self.base
            .as_ref()
            .ok_or_else(|| CoreError::inconsistent("reopen segments are not mounted"))
    }

    fn overlay(&self) -> CoreResult<Arc<PatchOverlay>> {
        self.overlay
            .clone()
            .ok_or_else(|| CoreError::inconsistent("reopen reader is not created"))
    }
}

/// Input of one chain run.
pub(super) struct ReopenContext<'a> {
    pub(super) shared: &'a OnlineShared,
    pub(super) state: ReopenState,
    /// Present only while the data lock is held.
    pub(super) writer: Option<&'a mut PartitionWriter>,
}

impl ReopenContext<'_> {
    fn writer(&mut self) -> CoreResult<&mut PartitionWriter> {
        self.writer
            .as_deref_mut()
            .ok_or_else(|| CoreError::inconsistent("reopen step needs the data lock"))
    }
}

/// A single reopen step.
pub(super) trait ReopenExecutor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()>;
}

/// Target version data joined with the writer's current segments.
///
/// Writer segments the target already covers entirely are left out.
fn compose(base: &PartitionData, writer_data: &PartitionData) -> PartitionData {
    let mut data = base.clone();
    data.adopt_writer_segments(writer_data);
    data.drop_pending_covered();
    data
}

/// Rejects the reopen when its projected memory exceeds the budget.
#[derive(Debug)]
struct EstimateMemory {
    kind: ReopenType,
}

impl ReopenExecutor for EstimateMemory {
    fn name(&self) -> &'static str {
        "estimate_memory"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let shared = ctx.shared;
        let target = &ctx.state.target;
        let required = match self.kind {
            // The old reader stays alive next to the segments still to load.
            ReopenType::Normal => {
                let unloaded: Vec<_> = {
                    let arena = shared.arena.lock();
                    target.segments().iter().copied().filter(|id| !arena.contains(*id)).collect()
                };
                let reader = shared.reader().map_or(0, |r| r.estimated_memory_use());
                reader + segment_bytes(shared.inc_dir.as_ref(), &unloaded)?
            }
            _ => {
                let rt = shared.data.lock().as_ref().map_or(0, |w| w.data().in_memory_use());
                rt + segment_bytes(shared.inc_dir.as_ref(), target.segments())?
            }
        };
        let available = shared.config.max_reopen_memory_use;
        debug!(kind = %self.kind, required, available, "reopen memory estimate");
        if required > available {
            return Err(CoreError::LackOfMemory { required, available });
        }
        Ok(())
    }
}

/// Loads the target version's segments.
#[derive(Debug)]
struct MountSegments {
    reload: bool,
}

impl ReopenExecutor for MountSegments {
    fn name(&self) -> &'static str {
        "mount_segments"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let shared = ctx.shared;
        let target = Arc::clone(&ctx.state.target);
        let built = if self.reload {
            let loaded = target
                .segments()
                .iter()
                .map(|id| BuiltSegment::load(shared.inc_dir.as_ref(), *id).map(Arc::new))
                .collect::<CoreResult<Vec<_>>>()?;
            let mut arena = shared.arena.lock();
            for segment in &loaded {
                arena.insert(Arc::clone(segment));
            }
            loaded
        } else {
            let mut arena = shared.arena.lock();
            target
                .segments()
                .iter()
                .map(|id| arena.get_or_load(shared.inc_dir.as_ref(), *id))
                .collect::<CoreResult<Vec<_>>>()?
        };
        debug!(version = %target.id(), segments = built.len(), reload = self.reload, "mounted segments");
        ctx.state.base = Some(PartitionData::new(target, built));
        Ok(())
    }
}

/// Builds the new overlay from the target's patches.
#[derive(Debug)]
struct CreateReader;

impl ReopenExecutor for CreateReader {
    fn name(&self) -> &'static str {
        "create_reader"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let writer_data = ctx.shared.writer_snapshot()?;
        let data = compose(ctx.state.base()?, &writer_data);
        let overlay = Arc::new(PatchOverlay::new());
        PatchLoader::load(&data, &overlay);
        let hidden = PatchModifier::new(&data, &overlay).hide_covered_writer_docs(&data, ctx.state.target.locator());
        debug!(hidden, "created reopen reader");
        ctx.state.data = Some(data);
        ctx.state.overlay = Some(overlay);
        Ok(())
    }
}

/// Catch-up redo passes outside the data lock.
#[derive(Debug)]
struct BatchRedo;

impl ReopenExecutor for BatchRedo {
    fn name(&self) -> &'static str {
        "batch_redo"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let shared = ctx.shared;
        let overlay = ctx.state.overlay()?;
        let base = ctx.state.base()?.clone();
        let budget = RedoBudget::from_config(&shared.config);
        let mut failed = None;
        let snapshot = || match shared.writer_snapshot() {
            Ok(writer_data) => compose(&base, &writer_data),
            Err(e) => {
                failed.get_or_insert(e);
                base.clone()
            }
        };
        ctx.state
            .redoer
            .catch_up(snapshot, &overlay, budget, &shared.counters)?;
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Last redo pass over the writer's live state. Needs the data lock.
#[derive(Debug)]
struct FinalRedo;

impl ReopenExecutor for FinalRedo {
    fn name(&self) -> &'static str {
        "final_redo"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let overlay = ctx.state.overlay()?;
        let writer_data = ctx.writer()?.data().clone();
        let data = compose(ctx.state.base()?, &writer_data);
        let counters = Arc::clone(&ctx.shared.counters);
        let seen = ctx.state.redoer.redo(&data, &overlay, &counters);
        debug!(
            operations = seen,
            redone = ctx.state.redoer.redone(),
            skipped = ctx.state.redoer.skipped(),
            cursor = %ctx.state.redoer.cursor(),
            "final redo pass"
        );
        ctx.state.data = Some(data);
        Ok(())
    }
}

/// Rebinds the writer to the new data and overlay.
#[derive(Debug)]
struct SwitchWriter;

impl ReopenExecutor for SwitchWriter {
    fn name(&self) -> &'static str {
        "switch_writer"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let overlay = ctx.state.overlay()?;
        let data = ctx
            .state
            .data
            .clone()
            .ok_or_else(|| CoreError::inconsistent("reopen data is not composed"))?;
        let writer = ctx.writer()?;
        writer.switch_data(data);
        writer.set_overlay(Some(overlay));
        Ok(())
    }
}

/// Moves dumped real-time segments into the writer's data in their loaded form.
#[derive(Debug)]
struct CollectDumped;

impl ReopenExecutor for CollectDumped {
    fn name(&self) -> &'static str {
        "collect_dumped"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let writer = ctx.writer()?;
        let switched = writer.collect_dumped();
        let data = writer.data().clone();
        let overlay = writer.overlay().cloned();
        debug!(segments = ?switched, "switched real-time segments to dumped copies");
        ctx.state.data = Some(data);
        ctx.state.overlay = overlay;
        Ok(())
    }
}

/// Dumps the real-time building segment and waits for every queued dump.
#[derive(Debug)]
struct DumpBuilding;

impl ReopenExecutor for DumpBuilding {
    fn name(&self) -> &'static str {
        "dump_building"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let queue = Arc::clone(&ctx.shared.dump_queue);
        let dumped = ctx.writer()?.dump_segment()?;
        queue.drain()?;
        debug!(segment = ?dumped, "dumped real-time building segment");
        Ok(())
    }
}

/// Publishes the new reader.
#[derive(Debug)]
struct PublishReader;

impl ReopenExecutor for PublishReader {
    fn name(&self) -> &'static str {
        "publish_reader"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        let data = ctx
            .state
            .data
            .clone()
            .ok_or_else(|| CoreError::inconsistent("reopen data is not composed"))?;
        let overlay = ctx.state.overlay.clone().unwrap_or_default();
        ctx.shared.publish(Arc::new(PartitionReader::new(data, overlay)));
        Ok(())
    }
}

/// Hands unused readers and segments to the cleaner.
#[derive(Debug)]
struct ScheduleCleanup;

impl ReopenExecutor for ScheduleCleanup {
    fn name(&self) -> &'static str {
        "schedule_cleanup"
    }

    fn execute(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        if !ctx.shared.trigger_cleaner() {
            let evicted = ctx.shared.container.evict_unused();
            ctx.shared
                .counters
                .acc(names::EVICTED_READER_COUNT)
                .increment(evicted as i64);
        }
        Ok(())
    }
}

/// An ordered list of reopen steps.
#[derive(Debug)]
pub(super) struct ExecutorChain {
    name: &'static str,
    executors: Vec<Box<dyn ReopenExecutor>>,
}

impl ExecutorChain {
    fn new(name: &'static str, executors: Vec<Box<dyn ReopenExecutor>>) -> Self {
        Self { name, executors }
    }

    /// Prepare and critical chains of a normal or force reopen.
    pub(super) fn reopen(kind: ReopenType) -> (Self, Self) {
        let force = kind == ReopenType::Force;
        let mut prepare: Vec<Box<dyn ReopenExecutor>> = vec![
            Box::new(EstimateMemory { kind }),
            Box::new(MountSegments { reload: force }),
            Box::new(CreateReader),
        ];
        if !force {
            prepare.push(Box::new(BatchRedo));
        }
        let critical: Vec<Box<dyn ReopenExecutor>> = vec![
            Box::new(FinalRedo),
            Box::new(SwitchWriter),
            Box::new(PublishReader),
            Box::new(ScheduleCleanup),
        ];
        let name = if force { "force_reopen" } else { "normal_reopen" };
        (Self::new(name, prepare), Self::new(name, critical))
    }

    /// Critical chain swapping in dumped real-time segments.
    pub(super) fn switch_rt() -> Self {
        Self::new(
            "switch_rt_segment_reopen",
            vec![Box::new(CollectDumped), Box::new(PublishReader), Box::new(ScheduleCleanup)],
        )
    }

    /// Critical chain dumping the building segment to free memory.
    pub(super) fn reclaim() -> Self {
        Self::new(
            "reclaim_reader_reopen",
            vec![
                Box::new(DumpBuilding),
                Box::new(CollectDumped),
                Box::new(PublishReader),
                Box::new(ScheduleCleanup),
            ],
        )
    }

    /// Runs every step in order, stopping at the first failure.
    pub(super) fn run(&self, ctx: &mut ReopenContext<'_>) -> CoreResult<()> {
        for executor in &self.executors {
            let started = Instant::now();
            if let Err(e) = executor.execute(ctx) {
                warn!(chain = self.name, step = executor.name(), error = %e, "reopen step failed");
                return Err(e);
            }
            debug!(
                chain = self.name,
                step = executor.name(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "reopen step done"
            );
        }
        Ok(())
    }
}
