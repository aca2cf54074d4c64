//! Applying logged operations to a reader's overlay.

use crate::locator::Locator;
use crate::oplog::{Operation, OperationKind};
use crate::partition_data::{PartitionData, SegmentHandle};
use crate::reader::overlay::PatchOverlay;
use crate::types::DocId;
use tracing::debug;

/// Applies operations to the segments of one [`PartitionData`] snapshot.
///
/// An operation only affects segments older (smaller id) than its origin.
/// Applying the same operation twice has no further effect.
pub struct PatchModifier<'a> {
    segments: Vec<SegmentHandle>,
    overlay: &'a PatchOverlay,
}

impl<'a> PatchModifier<'a> {
    /// Binds a modifier to a data snapshot and an overlay.
    #[must_use]
    pub fn new(data: &PartitionData, overlay: &'a PatchOverlay) -> Self {
        Self {
            segments: data.segments(),
            overlay,
        }
    }

    fn live_copy(&self, handle: &SegmentHandle, pk: &str) -> Option<DocId> {
        handle
            .lookup(pk)
            .filter(|doc_id| !self.overlay.is_deleted(handle.id(), *doc_id))
    }

    /// Applies one operation. Returns true if the overlay changed.
    pub fn apply(&self, op: &Operation) -> bool {
        let older = self.segments.iter().filter(|h| h.id() < op.origin);
        let changed = match &op.kind {
            OperationKind::Add { pk } | OperationKind::Delete { pk } => {
                let mut changed = false;
                for handle in older {
                    if let Some(doc_id) = self.live_copy(handle, pk) {
                        changed |= self.overlay.delete(handle.id(), doc_id);
                    }
                }
                changed
            }
            OperationKind::Update { pk, fields } => {
                let target = older
                    .rev()
                    .find_map(|handle| self.live_copy(handle, pk).map(|doc_id| (handle.id(), doc_id)));
                match target {
                    Some((segment, doc_id)) => {
                        self.overlay.update(segment, doc_id, fields);
                        true
                    }
                    None => false,
                }
            }
        };
        self.overlay.record_applied();
        changed
    }

    /// Hides writer documents whose add the version already covers.
    ///
    /// After a reopen the version may include documents that are still
    /// present in real-time segments; the versioned copy wins. Later updates
    /// of a hidden document are redone onto the versioned copy.
    pub fn hide_covered_writer_docs(&self, data: &PartitionData, covered_by: Locator) -> usize {
        let mut hidden = 0;
        for handle in data.writer_segments() {
            for doc_id in handle.live_doc_ids() {
                let covered = handle
                    .document(doc_id)
                    .is_some_and(|doc| covered_by.covers(&doc.locator));
                if covered && self.overlay.delete(handle.id(), doc_id) {
                    hidden += 1;
                }
            }
        }
        hidden
    }
}

/// Replays the operation logs and deletion patches of a version's segments.
pub struct PatchLoader;

impl PatchLoader {
    /// Applies every versioned segment's operations, ordered by origin
    /// segment and sequence, then their deletion patches.
    ///
    /// Returns the number of operations replayed.
    pub fn load(data: &PartitionData, overlay: &PatchOverlay) -> usize {
        let mut ops: Vec<&Operation> = data
            .built_segments()
            .iter()
            .flat_map(|segment| segment.operations().iter())
            .collect();
        ops.sort_by_key(|op| (op.origin, op.seq));
        ops.dedup_by_key(|op| (op.origin, op.seq));

        let modifier = PatchModifier::new(data, overlay);
        for op in &ops {
            modifier.apply(op);
        }

        let mut patched = 0;
        for segment in data.built_segments() {
            for entry in segment.deletion_patch() {
                if overlay.delete(entry.segment_id, entry.doc_id) {
                    patched += 1;
                }
            }
        }
        debug!(
            version = %data.version().id(),
            operations = ops.len(),
            patched,
            "loaded patches"
        );
        ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::segment::{BuildingSegment, BuiltSegment};
    use crate::types::SegmentId;
    use crate::version::Version;
    use std::sync::Arc;

    fn built(id: u32, docs: &[Document]) -> Arc<BuiltSegment> {
        let seg = BuildingSegment::new(SegmentId::new(id), 0, 100);
        for doc in docs {
            seg.apply(doc, 1).unwrap();
        }
        Arc::new(BuiltSegment::from_building(&seg, seg.info()))
    }

    fn data(segments: Vec<Arc<BuiltSegment>>) -> PartitionData {
        let mut editor = Version::empty().edit();
        for s in &segments {
            editor.add_segment(s.id());
        }
        PartitionData::new(Arc::new(editor.build()), segments)
    }

    #[test]
    fn newer_add_deletes_older_copy() {
        let data = data(vec![
            built(0, &[Document::add("a").field("v", "old")]),
            built(1, &[Document::add("a").field("v", "new")]),
        ]);
        let overlay = PatchOverlay::new();
        assert_eq!(PatchLoader::load(&data, &overlay), 2);

        assert!(overlay.is_deleted(SegmentId::new(0), 0));
        assert!(!overlay.is_deleted(SegmentId::new(1), 0));
    }

    #[test]
    fn update_targets_newest_live_copy() {
        let data = data(vec![
            built(0, &[Document::add("a")]),
            built(1, &[Document::update("a").field("price", "9")]),
        ]);
        let overlay = PatchOverlay::new();
        PatchLoader::load(&data, &overlay);

        let fields = overlay.updated_fields(SegmentId::new(0), 0).unwrap();
        assert_eq!(fields["price"], "9");
    }

    #[test]
    fn replay_is_idempotent() {
        let data = data(vec![
            built(0, &[Document::add("a"), Document::add("b")]),
            built(1, &[Document::delete("a")]),
        ]);
        let overlay = PatchOverlay::new();
        let modifier = PatchModifier::new(&data, &overlay);
        let op = &data.built_segments()[1].operations()[0];

        assert!(modifier.apply(op));
        assert!(!modifier.apply(op));
        assert_eq!(overlay.deleted_count(SegmentId::new(0)), 1);
    }

    #[test]
    fn operations_never_touch_newer_segments() {
        let data = data(vec![
            built(0, &[Document::delete("a")]),
            built(1, &[Document::add("a")]),
        ]);
        let overlay = PatchOverlay::new();
        PatchLoader::load(&data, &overlay);
        assert!(!overlay.is_deleted(SegmentId::new(1), 0));
    }
}
