//! Merging segments into fewer, larger ones.
//!
//! A merge is planned against the latest committed version, persisted as
//! merge meta, executed as checkpointed work items under a memory budget, and
//! only then committed as a new version. A failed merge commits nothing and
//! can be resumed: items whose checkpoint exists are skipped.
//!
//! [`ParallelPartitionDataMerger`] reconciles the versions of parallel build
//! shards instead.

mod parallel;
mod plan;
mod scheduler;
mod work_item;

pub use parallel::{ParallelBuildInfo, ParallelPartitionDataMerger, PARALLEL_BUILD_INFO_FILE, PARALLEL_DIR_PREFIX};
pub use plan::{MergeMeta, MergePlan, MergeStrategy, MERGE_META_DIR};
pub use scheduler::WorkItemScheduler;
pub use work_item::{
    item_identifier, CheckpointedWorkItem, DocumentMergeItem, MergeWorkItem, SummaryMergeItem,
};

use crate::builder::SegmentIdAllocator;
use crate::config::MergeConfig;
use crate::context::EngineContext;
use crate::counter::{names, CounterMap};
use crate::error::CoreResult;
use crate::partition_data::PartitionData;
use crate::reader::PartitionReader;
use crate::segment::SegmentArena;
use crate::types::{SegmentId, Timestamp, INVALID_TIMESTAMP};
use crate::version::{Version, VersionStore};
use sediment_storage::Directory;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Merges the segments of a partition directory.
#[derive(Debug)]
pub struct IndexPartitionMerger {
    ctx: Arc<EngineContext>,
    dir: Arc<dyn Directory>,
    config: MergeConfig,
    keep_version_count: usize,
    counters: Arc<CounterMap>,
}

impl IndexPartitionMerger {
    /// Creates a merger over `dir`.
    pub fn new(
        ctx: Arc<EngineContext>,
        dir: Arc<dyn Directory>,
        config: MergeConfig,
        keep_version_count: usize,
        counters: Arc<CounterMap>,
    ) -> Self {
        Self {
            ctx,
            dir,
            config,
            keep_version_count,
            counters,
        }
    }

    /// Loads the stored meta for `base`, or plans a new merge.
    fn prepare_meta(&self, base: &Version, data: &PartitionData, optimize: bool, timestamp: Timestamp) -> CoreResult<Option<MergeMeta>> {
        if let Some(meta) = MergeMeta::load(self.dir.as_ref())? {
            if meta.base_version == base.id() {
                debug!(base = %base.id(), plans = meta.plans.len(), "resuming merge");
                return Ok(Some(meta));
            }
            warn!(stale = %meta.base_version, base = %base.id(), "discarding stale merge meta");
            MergeMeta::remove(self.dir.as_ref())?;
        }

        let infos: Vec<_> = data.built_segments().iter().map(|s| s.info().clone()).collect();
        let groups = MergeStrategy::new(self.config.max_segment_count).create_plans(&infos, optimize);
        if groups.is_empty() {
            return Ok(None);
        }
        let mut allocator = SegmentIdAllocator::offline(base, self.dir.as_ref(), None)?;
        let plans = groups
            .into_iter()
            .map(|sources| MergePlan {
                sources,
                target: allocator.allocate(),
            })
            .collect();
        let meta = MergeMeta {
            base_version: base.id(),
            plans,
            timestamp,
        };
        meta.store(self.dir.as_ref())?;
        Ok(Some(meta))
    }

    fn work_items(&self, meta: &MergeMeta, reader: &Arc<PartitionReader>) -> Vec<Box<dyn MergeWorkItem>> {
        let mut items: Vec<Box<dyn MergeWorkItem>> = Vec::new();
        let merged_away = meta.sources();
        let retained: Vec<SegmentId> = reader
            .data()
            .version()
            .segments()
            .iter()
            .filter(|id| !merged_away.contains(id))
            .copied()
            .collect();
        for (index, plan) in meta.plans.iter().enumerate() {
            debug!(plan = index, segments = %work_item::describe_plan(plan), "scheduling merge plan");
            let tasks: [Box<dyn MergeWorkItem>; 2] = [
                Box::new(DocumentMergeItem::new(
                    index,
                    plan.clone(),
                    Arc::clone(reader),
                    Arc::clone(&self.dir),
                )),
                Box::new(SummaryMergeItem::new(
                    index,
                    plan.clone(),
                    Arc::clone(reader),
                    Arc::clone(&self.dir),
                    self.ctx.schema().schema_id,
                    retained.clone(),
                )),
            ];
            for task in tasks {
                if self.config.enable_checkpoint {
                    items.push(Box::new(CheckpointedWorkItem::new(
                        task,
                        Arc::clone(&self.dir),
                        Arc::clone(&self.counters),
                    )));
                } else {
                    items.push(task);
                }
            }
        }
        items
    }

    /// Merges the latest version.
    ///
    /// Returns the committed version, or `None` when there is nothing to merge.
    pub fn merge(&self, optimize: bool, timestamp: Timestamp) -> CoreResult<Option<Arc<Version>>> {
        let started = Instant::now();
        let store = VersionStore::new(Arc::clone(&self.dir));
        let Some(base) = store.load_latest()? else {
            return Ok(None);
        };
        let base = Arc::new(base);
        let mut arena = SegmentArena::new();
        let data = PartitionData::load(self.dir.as_ref(), Arc::clone(&base), &mut arena)?;

        let Some(meta) = self.prepare_meta(&base, &data, optimize, timestamp)? else {
            debug!(version = %base.id(), "nothing to merge");
            return Ok(None);
        };
        let reader = Arc::new(PartitionReader::open(data));
        let items = self.work_items(&meta, &reader);
        WorkItemScheduler::new(self.config.merge_threads, self.config.merge_memory_budget).run(&items)?;

        let sources = meta.sources();
        let mut editor = base.edit();
        for plan in &meta.plans {
            for source in &plan.sources {
                editor.remove_segment(*source);
            }
            editor.add_segment(plan.target);
        }
        if meta.timestamp != INVALID_TIMESTAMP {
            editor.set_timestamp(meta.timestamp);
        }
        editor.describe("last_merge_sources", sources.len().to_string());
        let version = editor.build();
        version.check_successor(&base, &sources)?;
        store.commit(&version)?;

        MergeMeta::remove(self.dir.as_ref())?;
        self.counters
            .acc(names::MERGED_SEGMENT_COUNT)
            .increment(sources.len() as i64);
        let cleaned = store.clean(self.keep_version_count, &BTreeSet::new())?;
        info!(
            version = %version.id(),
            merged = sources.len(),
            removed_segments = cleaned.removed_segments.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merge committed"
        );
        Ok(Some(Arc::new(version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{DumpQueue, PartitionWriter};
    use crate::config::BuildConfig;
    use crate::context::Schema;
    use crate::document::Document;
    use crate::segment::SegmentInfo;
    use crate::types::SegmentId;
    use sediment_storage::InMemoryDirectory;

    fn ctx() -> Arc<EngineContext> {
        Arc::new(EngineContext::normal(Schema::new("t")))
    }

    fn build(dir: &Arc<dyn Directory>, batches: &[&[Document]]) -> Version {
        let store = VersionStore::new(Arc::clone(dir));
        let version = store.load_or_empty(None).unwrap();
        let mut writer: PartitionWriter = ctx()
            .create_writer(
                Arc::clone(dir),
                PartitionData::unloaded(version),
                &BuildConfig::default(),
                Arc::new(DumpQueue::new()),
                Arc::new(CounterMap::new()),
            )
            .unwrap();
        for batch in batches {
            for doc in *batch {
                writer.add_document(doc).unwrap();
            }
            writer.dump_segment().unwrap();
        }
        writer
            .commit_version(&store, INVALID_TIMESTAMP)
            .unwrap()
            .unwrap()
            .as_ref()
            .clone()
    }

    fn merger(dir: &Arc<dyn Directory>) -> IndexPartitionMerger {
        ctx().create_merger(
            Arc::clone(dir),
            MergeConfig::default().max_segment_count(1),
            1,
            Arc::new(CounterMap::new()),
        )
    }

    #[test]
    fn merge_replaces_sources_with_target() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        build(
            &dir,
            &[
                &[Document::add("a"), Document::add("b")],
                &[Document::delete("a"), Document::update("b").field("p", "2")],
            ],
        );

        let merged = merger(&dir).merge(false, 77).unwrap().unwrap();
        assert_eq!(merged.segments(), &[SegmentId::new(2)]);
        assert_eq!(merged.timestamp(), 77);
        assert!(!dir.exists(MERGE_META_DIR));
        assert!(!dir.exists("segment_0"));

        let mut arena = SegmentArena::new();
        let reader = PartitionReader::open(PartitionData::load(dir.as_ref(), merged, &mut arena).unwrap());
        assert!(reader.lookup("a").is_none());
        assert_eq!(reader.lookup("b").unwrap().fields["p"], "2");
        assert_eq!(reader.doc_count(), 1);
    }

    #[test]
    fn repeated_full_merges_keep_no_operations() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        build(&dir, &[&[Document::add("a"), Document::add("b")], &[Document::delete("a")]]);
        let first = merger(&dir).merge(true, 1).unwrap().unwrap();
        let first_ops = SegmentInfo::load(dir.as_ref(), first.segments()[0]).unwrap().operation_count;
        assert_eq!(first_ops, 0);

        for round in 0..3 {
            let value = round.to_string();
            build(
                &dir,
                &[
                    &[Document::update("b").field("round", value.as_str())],
                    &[Document::add(format!("c{round}"))],
                ],
            );
            let merged = merger(&dir).merge(true, 2 + round).unwrap().unwrap();
            assert_eq!(merged.segments().len(), 1);
            let info = SegmentInfo::load(dir.as_ref(), merged.segments()[0]).unwrap();
            assert_eq!(info.operation_count, 0);

            let mut arena = SegmentArena::new();
            let reader = PartitionReader::open(PartitionData::load(dir.as_ref(), merged, &mut arena).unwrap());
            assert_eq!(reader.lookup("b").unwrap().fields["round"], value);
            assert_eq!(reader.doc_count(), 2 + round as usize);
        }
    }

    #[test]
    fn single_segment_needs_no_merge() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        build(&dir, &[&[Document::add("a")]]);
        assert!(merger(&dir).merge(true, INVALID_TIMESTAMP).unwrap().is_none());
    }

    #[test]
    fn resumed_merge_reuses_plan() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let base = build(&dir, &[&[Document::add("a")], &[Document::add("b")]]);
        let stored = MergeMeta {
            base_version: base.id(),
            plans: vec![MergePlan {
                sources: vec![SegmentId::new(0), SegmentId::new(1)],
                target: SegmentId::new(9),
            }],
            timestamp: 5,
        };
        stored.store(dir.as_ref()).unwrap();

        let merged = merger(&dir).merge(false, 100).unwrap().unwrap();
        assert_eq!(merged.segments(), &[SegmentId::new(9)]);
        assert_eq!(merged.timestamp(), 5);
        assert!(SegmentInfo::load(dir.as_ref(), SegmentId::new(9)).unwrap().merged);
    }
}
