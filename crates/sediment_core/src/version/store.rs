//! Persistence of versions in a partition directory.

use crate::error::{CoreError, CoreResult};
use crate::types::{SegmentId, VersionId};
use crate::version::Version;
use parking_lot::Mutex;
use sediment_storage::Directory;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanResult {
    /// Version files deleted.
    pub removed_versions: Vec<VersionId>,
    /// Segment directories deleted.
    pub removed_segments: Vec<SegmentId>,
}

/// Reads and commits `version.<id>` files.
///
/// Commits are atomic (`Directory::commit`) and strictly increasing: a
/// version whose id is not larger than every committed id is rejected.
#[derive(Debug)]
pub struct VersionStore {
    dir: Arc<dyn Directory>,
    last_committed: Mutex<Option<VersionId>>,
}

impl VersionStore {
    /// Creates a store over `dir`.
    pub fn new(dir: Arc<dyn Directory>) -> Self {
        Self {
            dir,
            last_committed: Mutex::new(None),
        }
    }

    /// Returns the directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    /// Lists committed version ids in ascending order.
    pub fn list_versions(&self) -> CoreResult<Vec<VersionId>> {
        let mut ids: Vec<VersionId> = self
            .dir
            .list("")?
            .iter()
            .filter_map(|name| VersionId::from_file_name(name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Returns the newest committed version id.
    pub fn latest_version_id(&self) -> CoreResult<Option<VersionId>> {
        Ok(self.list_versions()?.last().copied())
    }

    /// Loads version `id`.
    pub fn load(&self, id: VersionId) -> CoreResult<Version> {
        let name = id.file_name();
        let version = Version::from_json(&name, &self.dir.load(&name)?)?;
        if version.id() != id {
            return Err(CoreError::corruption(
                name,
                format!("file holds version {}", version.id()),
            ));
        }
        Ok(version)
    }

    /// Loads the newest committed version, if any.
    pub fn load_latest(&self) -> CoreResult<Option<Version>> {
        match self.latest_version_id()? {
            Some(id) => Ok(Some(self.load(id)?)),
            None => Ok(None),
        }
    }

    /// Loads `id`, or the newest version when `id` is `None`.
    ///
    /// A partition without versions yields [`Version::empty`].
    pub fn load_or_empty(&self, id: Option<VersionId>) -> CoreResult<Version> {
        match id {
            Some(id) => self.load(id),
            None => Ok(self.load_latest()?.unwrap_or_else(Version::empty)),
        }
    }

    /// Atomically writes `version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InconsistentState`] if the id does not exceed
    /// every committed id.
    pub fn commit(&self, version: &Version) -> CoreResult<()> {
        let mut last = self.last_committed.lock();
        let on_disk = self.latest_version_id()?;
        let newest = (*last).max(on_disk);
        if let Some(newest) = newest {
            if version.id() <= newest {
                return Err(CoreError::inconsistent(format!(
                    "cannot commit {} after {newest}",
                    version.id()
                )));
            }
        }
        if version.id() == VersionId::INITIAL {
            return Err(CoreError::bad_parameter("the empty version is never committed"));
        }
        self.dir.commit(&version.id().file_name(), &version.to_json()?)?;
        *last = Some(version.id());
        info!(version = %version, "committed version");
        Ok(())
    }

    /// Segment ids that have a directory in the partition.
    pub fn segment_dirs(&self) -> CoreResult<Vec<SegmentId>> {
        let mut ids: Vec<SegmentId> = self
            .dir
            .list("")?
            .iter()
            .filter_map(|name| SegmentId::from_dir_name(name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Removes old versions and the segments only they reference.
    ///
    /// Keeps the newest `keep_count` versions (at least one) plus every id in
    /// `in_use`. A segment directory is removed only if no kept version lists
    /// it and its id is not newer than the newest version's largest segment,
    /// so dumps not yet committed survive.
    pub fn clean(&self, keep_count: usize, in_use: &BTreeSet<VersionId>) -> CoreResult<CleanResult> {
        let ids = self.list_versions()?;
        let keep_count = keep_count.max(1);
        let Some(&newest_id) = ids.last() else {
            return Ok(CleanResult::default());
        };
        let cutoff = ids.len().saturating_sub(keep_count);
        let (old, recent) = ids.split_at(cutoff);

        let mut live = BTreeSet::new();
        let mut kept = Vec::new();
        for id in recent.iter().chain(old.iter().filter(|id| in_use.contains(id))) {
            let version = self.load(*id)?;
            live.extend(version.segments().iter().copied());
            kept.push(*id);
        }
        let newest = self.load(newest_id)?;
        let horizon = newest.max_segment_id();

        let mut result = CleanResult::default();
        for id in old.iter().filter(|id| !kept.contains(id)) {
            self.dir.remove(&id.file_name())?;
            result.removed_versions.push(*id);
        }
        for segment in self.segment_dirs()? {
            let committed_range = horizon.is_some_and(|h| segment <= h);
            if !live.contains(&segment) && committed_range && !segment.is_realtime() {
                match self.dir.remove(&segment.dir_name()) {
                    Ok(()) => result.removed_segments.push(segment),
                    Err(e) => warn!(segment = %segment, error = %e, "failed to remove segment"),
                }
            }
        }
        debug!(
            versions = result.removed_versions.len(),
            segments = result.removed_segments.len(),
            "cleaned partition"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentInfo;
    use sediment_storage::InMemoryDirectory;

    fn store() -> (Arc<dyn Directory>, VersionStore) {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        (Arc::clone(&dir), VersionStore::new(dir))
    }

    fn commit(store: &VersionStore, base: &Version, add: &[u32], remove: &[u32]) -> Version {
        let mut editor = base.edit();
        for id in add {
            editor.add_segment(SegmentId::new(*id));
            SegmentInfo::new(SegmentId::new(*id))
                .commit(store.directory().as_ref())
                .unwrap();
        }
        for id in remove {
            editor.remove_segment(SegmentId::new(*id));
        }
        let version = editor.build();
        store.commit(&version).unwrap();
        version
    }

    #[test]
    fn empty_partition_has_no_versions() {
        let (_, store) = store();
        assert!(store.load_latest().unwrap().is_none());
        assert_eq!(store.load_or_empty(None).unwrap(), Version::empty());
    }

    #[test]
    fn clean_without_versions_removes_nothing() {
        let (_, store) = store();
        let result = store.clean(2, &BTreeSet::new()).unwrap();
        assert!(result.removed_versions.is_empty());
        assert!(result.removed_segments.is_empty());
    }

    #[test]
    fn commit_and_load_latest() {
        let (_, store) = store();
        let v1 = commit(&store, &Version::empty(), &[0], &[]);
        let v2 = commit(&store, &v1, &[1], &[]);

        assert_eq!(store.list_versions().unwrap(), vec![v1.id(), v2.id()]);
        assert_eq!(store.load_latest().unwrap(), Some(v2));
    }

    #[test]
    fn commit_rejects_non_increasing_ids() {
        let (_, store) = store();
        let v1 = commit(&store, &Version::empty(), &[0], &[]);
        let err = store.commit(&v1).unwrap_err();
        assert!(matches!(err, CoreError::InconsistentState { .. }));
    }

    #[test]
    fn commit_rejects_ids_behind_other_writers() {
        let (dir, store) = store();
        let v1 = commit(&store, &Version::empty(), &[0], &[]);
        let other = VersionStore::new(dir);
        let v2 = v1.edit().build();
        other.commit(&v2).unwrap();

        assert!(store.commit(&v2).is_err());
    }

    #[test]
    fn clean_keeps_recent_and_in_use_versions() {
        let (dir, store) = store();
        let v1 = commit(&store, &Version::empty(), &[0, 1], &[]);
        let v2 = commit(&store, &v1, &[2], &[0]);
        let v3 = commit(&store, &v2, &[3], &[1]);
        let _v4 = commit(&store, &v3, &[4], &[2]);
        dir.make_directory("segment_9").unwrap();

        let in_use: BTreeSet<_> = [v2.id()].into_iter().collect();
        let result = store.clean(1, &in_use).unwrap();

        assert_eq!(result.removed_versions, vec![v1.id(), v3.id()]);
        assert_eq!(result.removed_segments, vec![SegmentId::new(0)]);
        assert!(dir.exists("segment_1"));
        assert!(dir.exists("segment_9"));
    }
}
