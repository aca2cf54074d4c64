//! Merge plans and their persisted form.

use crate::error::{CoreError, CoreResult};
use crate::segment::SegmentInfo;
use crate::types::{SegmentId, Timestamp, VersionId};
use sediment_storage::{join, Directory};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Directory holding the state of an unfinished merge.
pub const MERGE_META_DIR: &str = "merge_meta";
const PLAN_FILE: &str = "plan";
const CHECKPOINT_DIR: &str = "checkpoints";

/// Merge `sources` into the new segment `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    /// Segments merged away, ascending.
    pub sources: Vec<SegmentId>,
    /// The segment produced.
    pub target: SegmentId,
}

/// Every plan of one merge, persisted before any work starts.
///
/// A merge restarted on the same base version reuses the stored meta, so
/// target ids and work item identifiers stay stable and finished items are
/// skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMeta {
    /// Version the plans were computed from.
    pub base_version: VersionId,
    /// The plans.
    pub plans: Vec<MergePlan>,
    /// Timestamp given to the merged version.
    pub timestamp: Timestamp,
}

impl MergeMeta {
    fn plan_path() -> String {
        join(MERGE_META_DIR, PLAN_FILE)
    }

    /// Path of the checkpoint of work item `identifier`.
    #[must_use]
    pub fn checkpoint_path(identifier: &str) -> String {
        join(&join(MERGE_META_DIR, CHECKPOINT_DIR), identifier)
    }

    /// Loads the stored meta, if any.
    pub fn load(dir: &dyn Directory) -> CoreResult<Option<Self>> {
        let path = Self::plan_path();
        if !dir.exists(&path) {
            return Ok(None);
        }
        let meta = serde_json::from_slice(&dir.load(&path)?)
            .map_err(|e| CoreError::corruption(path, e.to_string()))?;
        Ok(Some(meta))
    }

    /// Atomically stores the meta.
    pub fn store(&self, dir: &dyn Directory) -> CoreResult<()> {
        dir.make_directory(&join(MERGE_META_DIR, CHECKPOINT_DIR))?;
        dir.commit(&Self::plan_path(), &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Removes the meta and every checkpoint.
    pub fn remove(dir: &dyn Directory) -> CoreResult<()> {
        if dir.exists(MERGE_META_DIR) {
            dir.remove(MERGE_META_DIR)?;
        }
        Ok(())
    }

    /// Every source segment of every plan.
    #[must_use]
    pub fn sources(&self) -> Vec<SegmentId> {
        self.plans.iter().flat_map(|p| p.sources.iter().copied()).collect()
    }
}

/// Chooses which segments to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStrategy {
    max_segment_count: usize,
}

impl MergeStrategy {
    /// Keeps at most `max_segment_count` segments after a merge.
    #[must_use]
    pub fn new(max_segment_count: usize) -> Self {
        Self {
            max_segment_count: max_segment_count.max(1),
        }
    }

    /// Groups segments into merges.
    ///
    /// With `optimize` every segment goes into one plan. Otherwise the
    /// smallest segments (by document count) are merged into one until no
    /// more than `max_segment_count` remain. A plan always has at least two
    /// sources; an empty result means there is nothing to merge.
    #[must_use]
    pub fn create_plans(&self, segments: &[SegmentInfo], optimize: bool) -> Vec<Vec<SegmentId>> {
        if segments.len() < 2 {
            return Vec::new();
        }
        let mut sources: Vec<SegmentId> = if optimize {
            segments.iter().map(|s| s.segment_id).collect()
        } else {
            if segments.len() <= self.max_segment_count {
                return Vec::new();
            }
            let mut by_size: Vec<&SegmentInfo> = segments.iter().collect();
            by_size.sort_by_key(|s| (s.doc_count, s.segment_id));
            let take = segments.len() - self.max_segment_count + 1;
            by_size.iter().take(take).map(|s| s.segment_id).collect()
        };
        sources.sort();
        debug!(optimize, sources = sources.len(), "created merge plan");
        vec![sources]
    }
}
