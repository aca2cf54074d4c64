//! Readers: consistent query views over partition data.
//!
//! A [`PartitionReader`] pairs a [`PartitionData`] snapshot with the
//! [`PatchOverlay`] holding cross-segment deletes and updates. Readers are
//! shared as `Arc<PartitionReader>`; the [`ReaderContainer`] tracks which
//! ones are still held by queries.

mod container;
mod modifier;
mod overlay;

pub use container::ReaderContainer;
pub use modifier::{PatchLoader, PatchModifier};
pub use overlay::PatchOverlay;

use crate::locator::Locator;
use crate::partition_data::{PartitionData, SegmentHandle};
use crate::types::{DocId, SegmentId, VersionId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A document returned by a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentView {
    /// Segment holding the document.
    pub segment_id: SegmentId,
    /// Local doc id.
    pub doc_id: DocId,
    /// Primary key.
    pub pk: String,
    /// Field values with updates applied.
    pub fields: BTreeMap<String, String>,
}

/// A consistent view of a partition.
#[derive(Debug)]
pub struct PartitionReader {
    data: PartitionData,
    overlay: Arc<PatchOverlay>,
}

impl PartitionReader {
    /// Creates a reader.
    #[must_use]
    pub fn new(data: PartitionData, overlay: Arc<PatchOverlay>) -> Self {
        Self { data, overlay }
    }

    /// Loads patches for `data` into a fresh overlay and returns the reader.
    #[must_use]
    pub fn open(data: PartitionData) -> Self {
        let overlay = Arc::new(PatchOverlay::new());
        PatchLoader::load(&data, &overlay);
        Self::new(data, overlay)
    }

    /// Returns the data snapshot.
    #[must_use]
    pub fn data(&self) -> &PartitionData {
        &self.data
    }

    /// Returns the overlay.
    #[must_use]
    pub fn overlay(&self) -> &Arc<PatchOverlay> {
        &self.overlay
    }

    /// Returns the version id the reader was built on.
    #[must_use]
    pub fn version_id(&self) -> VersionId {
        self.data.version().id()
    }

    /// Returns the furthest upstream position visible.
    #[must_use]
    pub fn locator(&self) -> Locator {
        self.data.locator()
    }

    /// Returns every segment id visible.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.data.segment_ids()
    }

    fn live(&self, handle: &SegmentHandle, doc_id: DocId) -> bool {
        !self.overlay.is_deleted(handle.id(), doc_id)
    }

    /// Finds the live document with primary key `pk`, newest segment first.
    #[must_use]
    pub fn lookup(&self, pk: &str) -> Option<DocumentView> {
        self.data.segments().iter().rev().find_map(|handle| {
            let doc_id = handle.lookup(pk).filter(|d| self.live(handle, *d))?;
            let stored = handle.document(doc_id)?;
            let mut fields = stored.fields;
            if let Some(updated) = self.overlay.updated_fields(handle.id(), doc_id) {
                fields.extend(updated);
            }
            Some(DocumentView {
                segment_id: handle.id(),
                doc_id,
                pk: stored.pk,
                fields,
            })
        })
    }

    /// Counts live documents.
    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.data
            .segments()
            .iter()
            .map(|handle| {
                handle
                    .live_doc_ids()
                    .into_iter()
                    .filter(|d| self.live(handle, *d))
                    .count()
            })
            .sum()
    }

    /// Primary keys of every live document, sorted.
    #[must_use]
    pub fn primary_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .segments()
            .iter()
            .flat_map(|handle| {
                handle
                    .live_doc_ids()
                    .into_iter()
                    .filter(|d| self.live(handle, *d))
                    .filter_map(|d| handle.document(d).map(|doc| doc.pk))
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Estimated memory held by the reader's segments and overlay.
    #[must_use]
    pub fn estimated_memory_use(&self) -> u64 {
        self.data.memory_use() + self.overlay.memory_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::segment::{BuildingSegment, BuiltSegment};
    use crate::version::Version;

    fn built(id: u32, docs: &[Document]) -> Arc<BuiltSegment> {
        let seg = BuildingSegment::new(SegmentId::new(id), 0, 100);
        for doc in docs {
            seg.apply(doc, 1).unwrap();
        }
        Arc::new(BuiltSegment::from_building(&seg, seg.info()))
    }

    fn reader(segments: Vec<Arc<BuiltSegment>>) -> PartitionReader {
        let mut editor = Version::empty().edit();
        for s in &segments {
            editor.add_segment(s.id());
        }
        PartitionReader::open(PartitionData::new(Arc::new(editor.build()), segments))
    }

    #[test]
    fn lookup_sees_newest_copy_and_updates() {
        let reader = reader(vec![
            built(0, &[Document::add("a").field("t", "old"), Document::add("b")]),
            built(1, &[Document::add("a").field("t", "new")]),
            built(2, &[Document::update("a").field("price", "3")]),
        ]);

        let view = reader.lookup("a").unwrap();
        assert_eq!(view.segment_id, SegmentId::new(1));
        assert_eq!(view.fields["t"], "new");
        assert_eq!(view.fields["price"], "3");
        assert_eq!(reader.doc_count(), 2);
    }

    #[test]
    fn deleted_documents_are_invisible() {
        let reader = reader(vec![
            built(0, &[Document::add("a"), Document::add("b")]),
            built(1, &[Document::delete("a")]),
        ]);
        assert!(reader.lookup("a").is_none());
        assert_eq!(reader.primary_keys(), vec!["b".to_string()]);
    }

    #[test]
    fn building_segment_is_visible_live() {
        let seg = Arc::new(BuildingSegment::new(SegmentId::first_realtime(), 0, 10));
        let mut data = PartitionData::unloaded(Version::empty());
        data.set_building(Some(Arc::clone(&seg)));
        let reader = PartitionReader::open(data);

        seg.apply(&Document::add("rt"), 1).unwrap();
        assert!(reader.lookup("rt").is_some());
    }
}
