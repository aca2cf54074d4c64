//! Immutable, persisted segments.

use crate::error::{CoreError, CoreResult};
use crate::oplog::{decode_operations, encode_operations, Operation};
use crate::segment::building::BuildingSegment;
use crate::segment::info::{
    DeletionEntry, SegmentData, SegmentInfo, StoredDocument, DATA_FILE, DELETION_PATCH_FILE,
    OPERATION_LOG_FILE,
};
use crate::types::{DocId, SegmentId};
use sediment_storage::Directory;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// A built segment loaded into memory.
///
/// Holds the documents, the segment's operation log (replayed against older
/// segments when a version is loaded) and an optional deletion patch.
#[derive(Debug)]
pub struct BuiltSegment {
    info: SegmentInfo,
    docs: Vec<StoredDocument>,
    pk_index: HashMap<String, DocId>,
    deleted: HashSet<DocId>,
    operations: Vec<Operation>,
    deletion_patch: Vec<DeletionEntry>,
}

impl BuiltSegment {
    /// Assembles a segment from its parts.
    #[must_use]
    pub fn from_parts(
        info: SegmentInfo,
        data: SegmentData,
        operations: Vec<Operation>,
        deletion_patch: Vec<DeletionEntry>,
    ) -> Self {
        let deleted: HashSet<DocId> = data.deleted.into_iter().collect();
        let mut pk_index = HashMap::with_capacity(data.docs.len());
        for (doc_id, doc) in data.docs.iter().enumerate() {
            let doc_id = doc_id as DocId;
            if !deleted.contains(&doc_id) {
                pk_index.insert(doc.pk.clone(), doc_id);
            }
        }
        Self {
            info,
            docs: data.docs,
            pk_index,
            deleted,
            operations,
            deletion_patch,
        }
    }

    /// Converts a dumped building segment without re-reading it from disk.
    #[must_use]
    pub fn from_building(segment: &BuildingSegment, info: SegmentInfo) -> Self {
        Self::from_parts(info, segment.data(), segment.oplog().snapshot(), Vec::new())
    }

    /// Loads segment `segment_id` from `dir`.
    ///
    /// # Errors
    ///
    /// Fails if the segment info is missing (an interrupted dump), or if any
    /// file fails to decode.
    pub fn load(dir: &dyn Directory, segment_id: SegmentId) -> CoreResult<Self> {
        let info = SegmentInfo::load(dir, segment_id)?;

        let data_name = SegmentInfo::path(segment_id, DATA_FILE);
        let data: SegmentData = serde_json::from_slice(&dir.load(&data_name)?)
            .map_err(|e| CoreError::corruption(data_name, e.to_string()))?;

        let log_name = SegmentInfo::path(segment_id, OPERATION_LOG_FILE);
        let operations = if dir.exists(&log_name) {
            decode_operations(&dir.load(&log_name)?)?
        } else {
            Vec::new()
        };

        let patch_name = SegmentInfo::path(segment_id, DELETION_PATCH_FILE);
        let deletion_patch = if dir.exists(&patch_name) {
            serde_json::from_slice(&dir.load(&patch_name)?)
                .map_err(|e| CoreError::corruption(patch_name, e.to_string()))?
        } else {
            Vec::new()
        };

        trace!(segment = %segment_id, docs = data.docs.len(), "loaded segment");
        Ok(Self::from_parts(info, data, operations, deletion_patch))
    }

    /// Writes a complete segment into `dir`, committing the info last.
    pub fn write(
        dir: &dyn Directory,
        info: &SegmentInfo,
        data: &SegmentData,
        operations: &[Operation],
        deletion_patch: &[DeletionEntry],
    ) -> CoreResult<()> {
        let id = info.segment_id;
        dir.make_directory(&id.dir_name())?;
        dir.store(&SegmentInfo::path(id, DATA_FILE), &serde_json::to_vec(data)?)?;
        dir.store(
            &SegmentInfo::path(id, OPERATION_LOG_FILE),
            &encode_operations(operations)?,
        )?;
        if !deletion_patch.is_empty() {
            dir.store(
                &SegmentInfo::path(id, DELETION_PATCH_FILE),
                &serde_json::to_vec(deletion_patch)?,
            )?;
        }
        info.commit(dir)
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.info.segment_id
    }

    /// Returns the metadata.
    #[must_use]
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Finds the document with primary key `pk`, ignoring cross-segment patches.
    #[must_use]
    pub fn lookup(&self, pk: &str) -> Option<DocId> {
        self.pk_index.get(pk).copied()
    }

    /// Returns document `doc_id`.
    #[must_use]
    pub fn document(&self, doc_id: DocId) -> Option<&StoredDocument> {
        self.docs.get(doc_id as usize)
    }

    /// Returns true if `doc_id` was superseded inside this segment.
    #[must_use]
    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.deleted.contains(&doc_id)
    }

    /// Ids of documents not superseded inside this segment.
    pub fn live_doc_ids(&self) -> impl Iterator<Item = DocId> + '_ {
        (0..self.docs.len() as DocId).filter(move |id| !self.deleted.contains(id))
    }

    /// Documents stored, including superseded ones.
    #[must_use]
    pub fn stored_count(&self) -> usize {
        self.docs.len()
    }

    /// The segment's operation log.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Deletions this segment applies to other segments.
    #[must_use]
    pub fn deletion_patch(&self) -> &[DeletionEntry] {
        &self.deletion_patch
    }

    /// Approximate memory held by the loaded segment.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        let ops: u64 = self.operations.iter().map(Operation::estimated_size).sum();
        self.info.byte_size + ops + (self.docs.len() as u64) * 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use sediment_storage::InMemoryDirectory;

    #[test]
    fn dumped_segment_loads_back() {
        let dir = InMemoryDirectory::new();
        let building = BuildingSegment::new(SegmentId::new(2), 0, 10);
        building.apply(&Document::add("a").field("t", "x"), 1).unwrap();
        building.apply(&Document::add("a").field("t", "y"), 1).unwrap();
        building.apply(&Document::add("b"), 1).unwrap();
        building.dump(&dir).unwrap();

        let built = BuiltSegment::load(&dir, SegmentId::new(2)).unwrap();
        assert_eq!(built.info().doc_count, 2);
        assert_eq!(built.operations().len(), 3);
        let a = built.lookup("a").unwrap();
        assert_eq!(built.document(a).unwrap().fields["t"], "y");
        assert!(built.is_deleted(0));
        assert_eq!(built.live_doc_ids().count(), 2);
    }

    #[test]
    fn interrupted_dump_fails_to_load() {
        let dir = InMemoryDirectory::new();
        dir.store("segment_5/data", b"{\"docs\":[]}").unwrap();
        let err = BuiltSegment::load(&dir, SegmentId::new(5)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn deletion_patch_round_trips() {
        let dir = InMemoryDirectory::new();
        let info = SegmentInfo::new(SegmentId::new(9));
        let patch = vec![DeletionEntry {
            segment_id: SegmentId::new(1),
            doc_id: 4,
        }];
        BuiltSegment::write(&dir, &info, &SegmentData::default(), &[], &patch).unwrap();

        let built = BuiltSegment::load(&dir, SegmentId::new(9)).unwrap();
        assert_eq!(built.deletion_patch(), &patch[..]);
    }
}
