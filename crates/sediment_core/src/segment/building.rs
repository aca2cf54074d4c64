//! The in-memory segment documents are built into.

use crate::document::{Document, DocumentKind};
use crate::error::{CoreError, CoreResult};
use crate::locator::Locator;
use crate::oplog::{Operation, OperationKind, OperationLog};
use crate::segment::info::{
    SegmentData, SegmentInfo, SegmentState, StoredDocument, DATA_FILE, OPERATION_LOG_FILE,
};
use crate::types::{DocId, SegmentId, Timestamp, INVALID_TIMESTAMP};
use parking_lot::{Mutex, RwLock};
use sediment_storage::Directory;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Result of applying a document to a building segment.
#[derive(Debug, Clone)]
pub struct Applied {
    /// The operation logged for the document.
    pub op: Operation,
    /// True if the document's target lived in this segment and was changed in place.
    pub in_place: bool,
}

#[derive(Debug)]
struct BuildingInner {
    docs: Vec<StoredDocument>,
    pk_index: HashMap<String, DocId>,
    deleted: BTreeSet<DocId>,
    locator: Locator,
    timestamp: Timestamp,
    byte_size: u64,
}

/// A segment that accepts documents.
///
/// Adds append a document; updates and deletes of keys that live in this
/// segment are applied in place. Every applied document is logged. Once
/// frozen the segment rejects further documents and waits to be dumped.
#[derive(Debug)]
pub struct BuildingSegment {
    id: SegmentId,
    schema_id: u32,
    shard: Option<u32>,
    max_docs: usize,
    state: Mutex<SegmentState>,
    inner: RwLock<BuildingInner>,
    oplog: OperationLog,
    memory: AtomicU64,
}

impl BuildingSegment {
    /// Creates an empty building segment.
    #[must_use]
    pub fn new(id: SegmentId, schema_id: u32, max_docs: usize) -> Self {
        Self {
            id,
            schema_id,
            shard: None,
            max_docs,
            state: Mutex::new(SegmentState::Building),
            inner: RwLock::new(BuildingInner {
                docs: Vec::new(),
                pk_index: HashMap::new(),
                deleted: BTreeSet::new(),
                locator: Locator::UNKNOWN,
                timestamp: INVALID_TIMESTAMP,
                byte_size: 0,
            }),
            oplog: OperationLog::new(id),
            memory: AtomicU64::new(0),
        }
    }

    /// Records the parallel shard producing this segment.
    #[must_use]
    pub fn with_shard(mut self, shard: Option<u32>) -> Self {
        self.shard = shard;
        self
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> SegmentState {
        *self.state.lock()
    }

    /// Applies a document.
    ///
    /// `estimated_size` is charged to the segment's memory use.
    ///
    /// # Errors
    ///
    /// - [`CoreError::OutOfMemory`] if an add does not fit; nothing is applied
    /// - [`CoreError::InconsistentState`] if the segment is frozen
    pub fn apply(&self, doc: &Document, estimated_size: u64) -> CoreResult<Applied> {
        let state = self.state.lock();
        if *state != SegmentState::Building {
            return Err(CoreError::inconsistent(format!(
                "segment {} is {:?}, not building",
                self.id, *state
            )));
        }
        let mut inner = self.inner.write();

        let (kind, in_place) = match doc.kind {
            DocumentKind::Add => {
                if inner.docs.len() >= self.max_docs {
                    return Err(CoreError::OutOfMemory {
                        segment_id: self.id.as_u32(),
                    });
                }
                let doc_id = inner.docs.len() as DocId;
                let stored = StoredDocument {
                    pk: doc.pk.clone(),
                    fields: doc.fields.clone(),
                    locator: doc.locator,
                    timestamp: doc.timestamp,
                };
                inner.byte_size += stored.byte_size();
                inner.docs.push(stored);
                if let Some(previous) = inner.pk_index.insert(doc.pk.clone(), doc_id) {
                    inner.deleted.insert(previous);
                }
                (OperationKind::Add { pk: doc.pk.clone() }, true)
            }
            DocumentKind::Update => {
                let target = inner.pk_index.get(&doc.pk).copied();
                if let Some(doc_id) = target {
                    let stored = &mut inner.docs[doc_id as usize];
                    stored.fields.extend(doc.fields.clone());
                }
                (
                    OperationKind::Update {
                        pk: doc.pk.clone(),
                        fields: doc.fields.clone(),
                    },
                    target.is_some(),
                )
            }
            DocumentKind::Delete => {
                let target = inner.pk_index.remove(&doc.pk);
                if let Some(doc_id) = target {
                    inner.deleted.insert(doc_id);
                }
                (OperationKind::Delete { pk: doc.pk.clone() }, target.is_some())
            }
        };

        inner.locator = inner.locator.advance(doc.locator);
        inner.timestamp = inner.timestamp.max(doc.timestamp);
        let op = self.oplog.append(doc.locator, doc.timestamp, kind);
        self.memory.fetch_add(estimated_size, Ordering::Relaxed);
        drop(inner);
        drop(state);
        Ok(Applied { op, in_place })
    }

    /// Finds the live document with primary key `pk`.
    #[must_use]
    pub fn lookup(&self, pk: &str) -> Option<DocId> {
        self.inner.read().pk_index.get(pk).copied()
    }

    /// Returns a copy of document `doc_id`.
    #[must_use]
    pub fn document(&self, doc_id: DocId) -> Option<StoredDocument> {
        self.inner.read().docs.get(doc_id as usize).cloned()
    }

    /// Returns true if `doc_id` was superseded inside this segment.
    #[must_use]
    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.inner.read().deleted.contains(&doc_id)
    }

    /// Returns the ids of documents not superseded inside this segment.
    #[must_use]
    pub fn live_doc_ids(&self) -> Vec<DocId> {
        let inner = self.inner.read();
        (0..inner.docs.len() as DocId)
            .filter(|id| !inner.deleted.contains(id))
            .collect()
    }

    /// Documents stored, including superseded ones.
    #[must_use]
    pub fn stored_count(&self) -> usize {
        self.inner.read().docs.len()
    }

    /// Documents not superseded inside this segment.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let inner = self.inner.read();
        inner.docs.len() - inner.deleted.len()
    }

    /// Returns true if nothing was applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.oplog.is_empty()
    }

    /// Estimated memory charged by applied documents.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        self.memory.load(Ordering::Relaxed)
    }

    /// Furthest upstream position applied.
    #[must_use]
    pub fn locator(&self) -> Locator {
        self.inner.read().locator
    }

    /// Newest document timestamp applied.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.inner.read().timestamp
    }

    /// Returns the operation log.
    #[must_use]
    pub fn oplog(&self) -> &OperationLog {
        &self.oplog
    }

    /// Stops accepting documents.
    pub fn freeze(&self) {
        let mut state = self.state.lock();
        if *state == SegmentState::Building {
            *state = SegmentState::Dumping;
        }
    }

    /// Builds the metadata describing the current contents.
    #[must_use]
    pub fn info(&self) -> SegmentInfo {
        let inner = self.inner.read();
        SegmentInfo {
            segment_id: self.id,
            doc_count: (inner.docs.len() - inner.deleted.len()) as u64,
            byte_size: inner.byte_size,
            operation_count: self.oplog.len() as u64,
            schema_id: self.schema_id,
            locator: inner.locator,
            timestamp: inner.timestamp,
            merged: false,
            shard: self.shard,
        }
    }

    /// Copies the document data.
    #[must_use]
    pub fn data(&self) -> SegmentData {
        let inner = self.inner.read();
        SegmentData {
            docs: inner.docs.clone(),
            deleted: inner.deleted.iter().copied().collect(),
        }
    }

    /// Writes the frozen segment into `dir` and marks it built.
    ///
    /// Data and log are written first; the segment info is committed last,
    /// so a segment directory without info is an interrupted dump.
    pub fn dump(&self, dir: &dyn Directory) -> CoreResult<SegmentInfo> {
        self.freeze();
        let info = self.info();
        let data = serde_json::to_vec(&self.data())?;
        dir.make_directory(&self.id.dir_name())?;
        dir.store(&SegmentInfo::path(self.id, DATA_FILE), &data)?;
        dir.store(
            &SegmentInfo::path(self.id, OPERATION_LOG_FILE),
            &self.oplog.encode()?,
        )?;
        info.commit(dir)?;
        *self.state.lock() = SegmentState::Built;
        debug!(
            segment = %self.id,
            docs = info.doc_count,
            operations = info.operation_count,
            "dumped segment"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_storage::InMemoryDirectory;

    fn segment() -> BuildingSegment {
        BuildingSegment::new(SegmentId::new(1), 0, 3)
    }

    #[test]
    fn add_supersedes_same_key_in_place() {
        let seg = segment();
        seg.apply(&Document::add("a").field("v", "1"), 10).unwrap();
        let applied = seg.apply(&Document::add("a").field("v", "2"), 10).unwrap();

        assert!(applied.in_place);
        assert_eq!(seg.live_count(), 1);
        assert_eq!(seg.stored_count(), 2);
        let doc = seg.document(seg.lookup("a").unwrap()).unwrap();
        assert_eq!(doc.fields["v"], "2");
        assert_eq!(seg.memory_use(), 20);
    }

    #[test]
    fn in_place_update_keeps_add_position() {
        let seg = segment();
        seg.apply(&Document::add("a").with_locator(Locator::new(0, 12)), 1).unwrap();
        seg.apply(&Document::update("a").field("f", "u").with_locator(Locator::new(0, 15)), 1)
            .unwrap();

        let doc = seg.document(seg.lookup("a").unwrap()).unwrap();
        assert_eq!(doc.fields["f"], "u");
        assert_eq!(doc.locator, Locator::new(0, 12));
        assert_eq!(seg.locator(), Locator::new(0, 15));
    }

    #[test]
    fn update_of_unknown_key_is_logged_not_applied() {
        let seg = segment();
        let applied = seg.apply(&Document::update("x").field("v", "1"), 5).unwrap();
        assert!(!applied.in_place);
        assert_eq!(seg.oplog().len(), 1);
        assert_eq!(seg.live_count(), 0);
    }

    #[test]
    fn delete_removes_from_index() {
        let seg = segment();
        seg.apply(&Document::add("a"), 1).unwrap();
        let applied = seg.apply(&Document::delete("a"), 1).unwrap();
        assert!(applied.in_place);
        assert_eq!(seg.lookup("a"), None);
        assert!(seg.is_deleted(0));
    }

    #[test]
    fn full_segment_rejects_adds() {
        let seg = segment();
        for pk in ["a", "b", "c"] {
            seg.apply(&Document::add(pk), 1).unwrap();
        }
        let err = seg.apply(&Document::add("d"), 1).unwrap_err();
        assert!(matches!(err, CoreError::OutOfMemory { segment_id: 1 }));
        assert_eq!(seg.oplog().len(), 3);
        seg.apply(&Document::delete("a"), 1).unwrap();
    }

    #[test]
    fn frozen_segment_rejects_documents() {
        let seg = segment();
        seg.freeze();
        assert!(seg.apply(&Document::add("a"), 1).is_err());
        assert_eq!(seg.state(), SegmentState::Dumping);
    }

    #[test]
    fn dump_writes_info_last() {
        let dir = InMemoryDirectory::new();
        let seg = segment();
        seg.apply(&Document::add("a").with_locator(Locator::new(0, 5)), 1)
            .unwrap();

        let info = seg.dump(&dir).unwrap();

        assert_eq!(seg.state(), SegmentState::Built);
        assert_eq!(info.doc_count, 1);
        assert_eq!(info.locator, Locator::new(0, 5));
        assert!(dir.exists("segment_1/data"));
        assert!(dir.exists("segment_1/operation_log"));
        assert_eq!(SegmentInfo::load(&dir, SegmentId::new(1)).unwrap(), info);
    }
}
