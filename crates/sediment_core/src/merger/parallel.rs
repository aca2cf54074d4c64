//! Reconciliation of parallel build shards.
//!
//! Shards branch from the same base version and write into their own
//! directories under the partition root:
//!
//! ```text
//! <partition>/
//! ├─ version.<base>
//! ├─ parallel_0/
//! │  ├─ parallel_build_info
//! │  ├─ version.<base+1>
//! │  └─ segment_<id>/
//! └─ parallel_1/
//!    └─ ...
//! ```

use crate::context::EngineContext;
use crate::counter::{names, CounterMap};
use crate::error::{CoreError, CoreResult};
use crate::partition_data::PartitionData;
use crate::reader::{PatchLoader, PatchOverlay};
use crate::segment::{DeletionEntry, SegmentArena, SegmentData, SegmentInfo, BuiltSegment};
use crate::types::{SegmentId, VersionId, INVALID_TIMESTAMP};
use crate::version::{Version, VersionStore};
use sediment_storage::{join, Directory, SubDirectory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the file describing a shard.
pub const PARALLEL_BUILD_INFO_FILE: &str = "parallel_build_info";
/// Prefix of shard directory names.
pub const PARALLEL_DIR_PREFIX: &str = "parallel_";

/// Identity of one parallel build shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelBuildInfo {
    /// Number of shards.
    pub parallel_num: u32,
    /// This shard, in `0..parallel_num`.
    pub instance_id: u32,
    /// Build round the shards belong to.
    pub batch_id: u64,
    /// Version every shard starts from.
    pub base_version: VersionId,
}

impl ParallelBuildInfo {
    /// Creates shard info.
    #[must_use]
    pub fn new(parallel_num: u32, instance_id: u32, batch_id: u64, base_version: VersionId) -> Self {
        Self {
            parallel_num,
            instance_id,
            batch_id,
            base_version,
        }
    }

    /// Directory name of this shard.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("{PARALLEL_DIR_PREFIX}{}", self.instance_id)
    }

    /// Checks the info is usable.
    pub fn validate(&self) -> CoreResult<()> {
        if self.parallel_num == 0 || self.instance_id >= self.parallel_num {
            return Err(CoreError::bad_parameter(format!(
                "instance {} out of {} shards",
                self.instance_id, self.parallel_num
            )));
        }
        Ok(())
    }

    /// Loads the info of the shard rooted at `dir`.
    pub fn load(dir: &dyn Directory) -> CoreResult<Self> {
        let bytes = dir.load(PARALLEL_BUILD_INFO_FILE)?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::corruption(PARALLEL_BUILD_INFO_FILE, e.to_string()))
    }

    /// Stores the info into the shard rooted at `dir`.
    ///
    /// A shard directory already holding different info is rejected.
    pub fn store(&self, dir: &dyn Directory) -> CoreResult<()> {
        if dir.exists(PARALLEL_BUILD_INFO_FILE) {
            let existing = Self::load(dir)?;
            if existing != *self {
                return Err(CoreError::inconsistent(format!(
                    "shard directory holds {existing:?}, expected {self:?}"
                )));
            }
            return Ok(());
        }
        dir.commit(PARALLEL_BUILD_INFO_FILE, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// What one shard contributes.
#[derive(Debug)]
struct ShardState {
    dir_name: String,
    info: ParallelBuildInfo,
    version: Version,
    new_segments: Vec<SegmentId>,
}

/// Merges the versions of parallel build shards into the partition root.
///
/// The merged version lists the base segments followed by the sorted union
/// of every shard's new segments. Running the merge again after a crash
/// finishes the moves and commits the same version.
#[derive(Debug)]
pub struct ParallelPartitionDataMerger {
    ctx: Arc<EngineContext>,
    dir: Arc<dyn Directory>,
    keep_version_count: usize,
    counters: Arc<CounterMap>,
}

impl ParallelPartitionDataMerger {
    /// Creates a merger over the partition root `dir`.
    pub fn new(
        ctx: Arc<EngineContext>,
        dir: Arc<dyn Directory>,
        keep_version_count: usize,
        counters: Arc<CounterMap>,
    ) -> Self {
        Self {
            ctx,
            dir,
            keep_version_count,
            counters,
        }
    }

    fn shard_dirs(&self) -> CoreResult<Vec<String>> {
        Ok(self
            .dir
            .list("")?
            .into_iter()
            .filter(|name| {
                name.strip_prefix(PARALLEL_DIR_PREFIX)
                    .is_some_and(|rest| rest.parse::<u32>().is_ok())
            })
            .collect())
    }

    fn load_shards(&self) -> CoreResult<Vec<ShardState>> {
        let mut shards = Vec::new();
        for dir_name in self.shard_dirs()? {
            let shard_dir: Arc<dyn Directory> = Arc::new(SubDirectory::new(Arc::clone(&self.dir), &dir_name));
            let info = ParallelBuildInfo::load(shard_dir.as_ref())?;
            let store = VersionStore::new(Arc::clone(&shard_dir));
            let Some(version) = store.load_latest()? else {
                warn!(shard = %dir_name, "shard committed no version, skipping");
                continue;
            };
            shards.push(ShardState {
                dir_name,
                info,
                version,
                new_segments: Vec::new(),
            });
        }
        Ok(shards)
    }

    fn load_base(store: &VersionStore, id: VersionId) -> CoreResult<Version> {
        if id == VersionId::INITIAL {
            Ok(Version::empty())
        } else {
            store.load(id)
        }
    }

    /// Validates the shards and returns their common base version.
    fn validate(&self, shards: &mut [ShardState], store: &VersionStore) -> CoreResult<Version> {
        let first = &shards[0].info;
        let (base_id, batch_id) = (first.base_version, first.batch_id);
        for shard in shards.iter() {
            if shard.info.base_version != base_id || shard.info.batch_id != batch_id {
                return Err(CoreError::inconsistent(format!(
                    "shard {} branched from {} batch {}, expected {} batch {}",
                    shard.dir_name, shard.info.base_version, shard.info.batch_id, base_id, batch_id
                )));
            }
        }
        let base = Self::load_base(store, base_id)?;

        let mut owners: BTreeMap<SegmentId, String> = BTreeMap::new();
        for shard in shards.iter_mut() {
            if let Some(missing) = base.segments().iter().find(|id| !shard.version.has_segment(**id)) {
                return Err(CoreError::inconsistent(format!(
                    "shard {} lost base segment {missing}",
                    shard.dir_name
                )));
            }
            shard.new_segments = shard
                .version
                .segments()
                .iter()
                .filter(|id| !base.has_segment(**id))
                .copied()
                .collect();
            for id in &shard.new_segments {
                if let Some(other) = owners.insert(*id, shard.dir_name.clone()) {
                    return Err(CoreError::inconsistent(format!(
                        "segment {id} is new in both {other} and {}",
                        shard.dir_name
                    )));
                }
            }
        }
        Ok(base)
    }

    fn move_segments(&self, shard: &ShardState) -> CoreResult<()> {
        for id in &shard.new_segments {
            let target = id.dir_name();
            if self.dir.exists(&target) {
                debug!(segment = %id, "segment already moved");
                continue;
            }
            self.dir.rename(&join(&shard.dir_name, &target), &target)?;
        }
        Ok(())
    }

    /// Writes a segment holding the deletions that span shards.
    ///
    /// Each shard only knew its own segments; replaying every shard's log
    /// against the merged segment set finds documents a newer shard
    /// superseded.
    fn write_reconcile_segment(&self, version: &Version, id: SegmentId) -> CoreResult<()> {
        let mut arena = SegmentArena::new();
        let data = PartitionData::load(self.dir.as_ref(), Arc::new(version.clone()), &mut arena)?;
        let overlay = PatchOverlay::new();
        PatchLoader::load(&data, &overlay);

        let patch: Vec<DeletionEntry> = data
            .segment_ids()
            .into_iter()
            .flat_map(|segment_id| {
                overlay
                    .deleted_docs(segment_id)
                    .into_iter()
                    .map(move |doc_id| DeletionEntry { segment_id, doc_id })
            })
            .collect();
        let mut info = SegmentInfo::new(id);
        info.locator = version.locator();
        info.timestamp = version.timestamp();
        info.schema_id = self.ctx.schema().schema_id;
        info.merged = true;
        BuiltSegment::write(self.dir.as_ref(), &info, &SegmentData::default(), &[], &patch)?;
        debug!(segment = %id, deletions = patch.len(), "wrote shard reconcile segment");
        Ok(())
    }

    /// Merges every shard into a new root version.
    ///
    /// Returns `None` if there are no shards.
    ///
    /// # Errors
    ///
    /// [`CoreError::InconsistentState`] if shards disagree on base version or
    /// batch, or two shards introduce the same segment id. Nothing is
    /// committed in that case.
    pub fn merge(&self) -> CoreResult<Option<Arc<Version>>> {
        let mut shards = self.load_shards()?;
        if shards.is_empty() {
            return Ok(None);
        }
        let store = VersionStore::new(Arc::clone(&self.dir));
        let base = self.validate(&mut shards, &store)?;

        let new_segments: BTreeSet<SegmentId> = shards
            .iter()
            .flat_map(|s| s.new_segments.iter().copied())
            .collect();

        if let Some(latest) = store.latest_version_id()? {
            if latest != base.id() {
                // A previous run committed but did not remove the shards.
                let committed = store.load(latest)?;
                if latest == base.id().next() && new_segments.iter().all(|id| committed.has_segment(*id)) {
                    info!(version = %latest, "shards already merged, removing leftovers");
                    self.remove_shards(&shards);
                    return Ok(Some(Arc::new(committed)));
                }
                return Err(CoreError::inconsistent(format!(
                    "partition moved to {latest} since shards branched from {}",
                    base.id()
                )));
            }
        }

        for shard in &shards {
            self.move_segments(shard)?;
        }
        let mut editor = base.edit();
        for id in &new_segments {
            editor.add_segment(*id);
        }
        let mut timestamp = base.timestamp();
        for shard in &shards {
            editor.advance_locator(shard.version.locator());
            timestamp = timestamp.max(shard.version.timestamp());
        }
        if timestamp != INVALID_TIMESTAMP {
            editor.set_timestamp(timestamp);
        }
        editor
            .set_schema_version(self.ctx.schema().schema_id)
            .describe("parallel_batch_id", shards[0].info.batch_id.to_string())
            .describe("parallel_num", shards.len().to_string());

        if self.ctx.strategy().needs_shard_reconcile_segment() && shards.len() > 1 {
            let merged_so_far = editor.build();
            let next = merged_so_far
                .max_segment_id()
                .map_or(SegmentId::new(0), |id| id.advance(1));
            let next = self
                .existing_segment_horizon()?
                .map_or(next, |h| next.max(h.advance(1)));
            self.write_reconcile_segment(&merged_so_far, next)?;
            editor.add_segment(next);
        }

        let version = editor.build();
        version.check_successor(&base, &[])?;
        store.commit(&version)?;
        self.counters
            .acc(names::MERGED_SEGMENT_COUNT)
            .increment(new_segments.len() as i64);

        self.remove_shards(&shards);
        store.clean(self.keep_version_count, &BTreeSet::new())?;
        info!(
            version = %version.id(),
            shards = shards.len(),
            new_segments = new_segments.len(),
            "merged parallel build shards"
        );
        Ok(Some(Arc::new(version)))
    }

    fn remove_shards(&self, shards: &[ShardState]) {
        for shard in shards {
            if let Err(e) = self.dir.remove(&shard.dir_name) {
                warn!(shard = %shard.dir_name, error = %e, "failed to remove shard directory");
            }
        }
    }

    fn existing_segment_horizon(&self) -> CoreResult<Option<SegmentId>> {
        Ok(self
            .dir
            .list("")?
            .iter()
            .filter_map(|name| SegmentId::from_dir_name(name))
            .filter(|id| !id.is_realtime())
            .max())
    }
}
