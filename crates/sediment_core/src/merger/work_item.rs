//! Units of merge work.

use crate::counter::{names, CounterMap};
use crate::error::CoreResult;
use crate::merger::plan::{MergeMeta, MergePlan};
use crate::oplog::{encode_operations, Operation};
use crate::reader::PartitionReader;
use crate::segment::{
    DeletionEntry, SegmentData, SegmentInfo, StoredDocument, DATA_FILE, DELETION_PATCH_FILE, OPERATION_LOG_FILE,
};
use crate::types::{SegmentId, INVALID_TIMESTAMP};
use crate::locator::Locator;
use sediment_storage::Directory;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// One unit of merge work.
///
/// Items of a merge run concurrently and must write disjoint files.
pub trait MergeWorkItem: Send + Sync + fmt::Debug {
    /// Stable identifier, `plan_<p>_task_<t>`.
    fn identifier(&self) -> &str;

    /// Estimated peak memory while processing.
    fn estimate_memory(&self) -> u64;

    /// Does the work.
    fn process(&self) -> CoreResult<()>;
}

/// Builds the identifier of task `task` of plan `plan`.
#[must_use]
pub fn item_identifier(plan: usize, task: usize) -> String {
    format!("plan_{plan}_task_{task}")
}

/// Live documents of `plan`'s sources with patches applied, oldest first.
fn merged_documents(reader: &PartitionReader, plan: &MergePlan) -> Vec<StoredDocument> {
    let overlay = reader.overlay();
    let mut docs = Vec::new();
    for handle in reader.data().segments() {
        if !plan.sources.contains(&handle.id()) {
            continue;
        }
        for doc_id in handle.live_doc_ids() {
            if overlay.is_deleted(handle.id(), doc_id) {
                continue;
            }
            if let Some(mut doc) = handle.document(doc_id) {
                if let Some(updated) = overlay.updated_fields(handle.id(), doc_id) {
                    doc.fields.extend(updated);
                }
                docs.push(doc);
            }
        }
    }
    docs
}

fn source_memory(reader: &PartitionReader, plan: &MergePlan) -> u64 {
    reader
        .data()
        .segments()
        .iter()
        .filter(|h| plan.sources.contains(&h.id()))
        .map(|h| h.memory_use())
        .sum()
}

/// Writes the merged documents of one plan.
#[derive(Debug)]
pub struct DocumentMergeItem {
    identifier: String,
    plan: MergePlan,
    reader: Arc<PartitionReader>,
    dir: Arc<dyn Directory>,
}

impl DocumentMergeItem {
    /// Creates the item for plan number `index`.
    #[must_use]
    pub fn new(index: usize, plan: MergePlan, reader: Arc<PartitionReader>, dir: Arc<dyn Directory>) -> Self {
        Self {
            identifier: item_identifier(index, 0),
            plan,
            reader,
            dir,
        }
    }
}

impl MergeWorkItem for DocumentMergeItem {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn estimate_memory(&self) -> u64 {
        source_memory(&self.reader, &self.plan)
    }

    fn process(&self) -> CoreResult<()> {
        let data = SegmentData {
            docs: merged_documents(&self.reader, &self.plan),
            deleted: Vec::new(),
        };
        let target = self.plan.target;
        self.dir.make_directory(&target.dir_name())?;
        self.dir
            .store(&SegmentInfo::path(target, DATA_FILE), &serde_json::to_vec(&data)?)?;
        debug!(target = %target, docs = data.docs.len(), "wrote merged documents");
        Ok(())
    }
}

/// Writes the operation log, deletion patch and segment info of one plan's
/// target.
///
/// Effects on the plan's sources are already in the merged documents. An
/// operation is kept, with its original origin, only while some retained
/// segment older than its origin survives the merge; deletion patch entries
/// are kept only when they target a retained segment.
#[derive(Debug)]
pub struct SummaryMergeItem {
    identifier: String,
    plan: MergePlan,
    reader: Arc<PartitionReader>,
    dir: Arc<dyn Directory>,
    schema_id: u32,
    retained: Vec<SegmentId>,
}

impl SummaryMergeItem {
    /// Creates the item for plan number `index`.
    ///
    /// `retained` lists the segments of the merged version that no plan
    /// merges away.
    #[must_use]
    pub fn new(
        index: usize,
        plan: MergePlan,
        reader: Arc<PartitionReader>,
        dir: Arc<dyn Directory>,
        schema_id: u32,
        retained: Vec<SegmentId>,
    ) -> Self {
        Self {
            identifier: item_identifier(index, 1),
            plan,
            reader,
            dir,
            schema_id,
            retained,
        }
    }

    fn affects_retained(&self, op: &Operation) -> bool {
        self.retained.iter().any(|id| *id < op.origin)
    }
}

impl MergeWorkItem for SummaryMergeItem {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn estimate_memory(&self) -> u64 {
        source_memory(&self.reader, &self.plan) / 2
    }

    fn process(&self) -> CoreResult<()> {
        let mut operations: Vec<Operation> = Vec::new();
        let mut patch: Vec<DeletionEntry> = Vec::new();
        let mut pruned = 0;
        let mut info = SegmentInfo::new(self.plan.target);
        info.locator = Locator::UNKNOWN;
        info.timestamp = INVALID_TIMESTAMP;
        for segment in self.reader.data().built_segments() {
            if !self.plan.sources.contains(&segment.id()) {
                continue;
            }
            for op in segment.operations() {
                if self.affects_retained(op) {
                    operations.push(op.clone());
                } else {
                    pruned += 1;
                }
            }
            patch.extend(
                segment
                    .deletion_patch()
                    .iter()
                    .filter(|entry| self.retained.contains(&entry.segment_id))
                    .copied(),
            );
            info.locator = info.locator.advance(segment.info().locator);
            info.timestamp = info.timestamp.max(segment.info().timestamp);
        }
        operations.sort_by_key(|op| (op.origin, op.seq));
        operations.dedup_by_key(|op| (op.origin, op.seq));
        patch.sort_by_key(|entry| (entry.segment_id, entry.doc_id));
        patch.dedup();

        let docs = merged_documents(&self.reader, &self.plan);
        info.doc_count = docs.len() as u64;
        info.byte_size = docs.iter().map(StoredDocument::byte_size).sum();
        info.operation_count = operations.len() as u64;
        info.schema_id = self.schema_id;
        info.merged = true;

        let target = self.plan.target;
        self.dir.make_directory(&target.dir_name())?;
        self.dir.store(
            &SegmentInfo::path(target, OPERATION_LOG_FILE),
            &encode_operations(&operations)?,
        )?;
        if !patch.is_empty() {
            self.dir.store(
                &SegmentInfo::path(target, DELETION_PATCH_FILE),
                &serde_json::to_vec(&patch)?,
            )?;
        }
        info.commit(self.dir.as_ref())?;
        debug!(
            target = %target,
            operations = info.operation_count,
            pruned,
            patched = patch.len(),
            "wrote merged summary"
        );
        Ok(())
    }
}

/// Skips an item whose checkpoint exists and writes the checkpoint after a
/// successful run.
#[derive(Debug)]
pub struct CheckpointedWorkItem {
    inner: Box<dyn MergeWorkItem>,
    dir: Arc<dyn Directory>,
    counters: Arc<CounterMap>,
}

impl CheckpointedWorkItem {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn MergeWorkItem>, dir: Arc<dyn Directory>, counters: Arc<CounterMap>) -> Self {
        Self { inner, dir, counters }
    }

    /// Returns true if the item already finished in an earlier run.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.dir.exists(&MergeMeta::checkpoint_path(self.inner.identifier()))
    }
}

impl MergeWorkItem for CheckpointedWorkItem {
    fn identifier(&self) -> &str {
        self.inner.identifier()
    }

    fn estimate_memory(&self) -> u64 {
        if self.is_done() {
            0
        } else {
            self.inner.estimate_memory()
        }
    }

    fn process(&self) -> CoreResult<()> {
        if self.is_done() {
            trace!(item = self.identifier(), "checkpoint found, skipping");
            self.counters.acc(names::MERGE_CHECKPOINT_SKIP_COUNT).increment(1);
            return Ok(());
        }
        self.inner.process()?;
        self.dir
            .commit(&MergeMeta::checkpoint_path(self.identifier()), b"done")?;
        Ok(())
    }
}

/// Segments a plan reads, for diagnostics.
#[must_use]
pub fn describe_plan(plan: &MergePlan) -> String {
    let sources: Vec<String> = plan.sources.iter().map(SegmentId::to_string).collect();
    format!("[{}] -> {}", sources.join(", "), plan.target)
}
