//! Deletions and field updates layered over immutable segments.

use crate::types::{DocId, SegmentId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
struct OverlayInner {
    deleted: HashMap<SegmentId, HashSet<DocId>>,
    updates: HashMap<(SegmentId, DocId), BTreeMap<String, String>>,
    bytes: u64,
}

/// Patch state of one reader lineage.
///
/// Segments never change after they are frozen, so the effect of deletes and
/// updates aimed at documents in older segments is recorded here.
#[derive(Debug, Default)]
pub struct PatchOverlay {
    inner: RwLock<OverlayInner>,
    applied: AtomicU64,
}

impl PatchOverlay {
    /// Creates an empty overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an independent copy.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
            applied: AtomicU64::new(self.applied.load(Ordering::Relaxed)),
        }
    }

    /// Marks a document deleted. Returns true if it was live before.
    pub fn delete(&self, segment: SegmentId, doc_id: DocId) -> bool {
        let mut inner = self.inner.write();
        let inserted = inner.deleted.entry(segment).or_default().insert(doc_id);
        if inserted {
            inner.bytes += 8;
        }
        inserted
    }

    /// Returns true if the document is deleted by a patch.
    #[must_use]
    pub fn is_deleted(&self, segment: SegmentId, doc_id: DocId) -> bool {
        self.inner
            .read()
            .deleted
            .get(&segment)
            .is_some_and(|docs| docs.contains(&doc_id))
    }

    /// Merges field values into a document.
    pub fn update(&self, segment: SegmentId, doc_id: DocId, fields: &BTreeMap<String, String>) {
        let added: usize = fields.iter().map(|(k, v)| k.len() + v.len()).sum();
        let mut inner = self.inner.write();
        inner.bytes += added as u64;
        inner
            .updates
            .entry((segment, doc_id))
            .or_default()
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Returns the patched fields of a document.
    #[must_use]
    pub fn updated_fields(&self, segment: SegmentId, doc_id: DocId) -> Option<BTreeMap<String, String>> {
        self.inner.read().updates.get(&(segment, doc_id)).cloned()
    }

    /// Number of documents of `segment` deleted by patches.
    #[must_use]
    pub fn deleted_count(&self, segment: SegmentId) -> usize {
        self.inner.read().deleted.get(&segment).map_or(0, HashSet::len)
    }

    /// Documents of `segment` deleted by patches.
    #[must_use]
    pub fn deleted_docs(&self, segment: SegmentId) -> Vec<DocId> {
        let mut docs: Vec<DocId> = self
            .inner
            .read()
            .deleted
            .get(&segment)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();
        docs.sort_unstable();
        docs
    }

    /// Records that one operation was processed.
    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Operations processed into this overlay.
    #[must_use]
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Approximate memory held.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        self.inner.read().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_is_idempotent() {
        let overlay = PatchOverlay::new();
        assert!(overlay.delete(SegmentId::new(1), 3));
        assert!(!overlay.delete(SegmentId::new(1), 3));
        assert!(overlay.is_deleted(SegmentId::new(1), 3));
        assert!(!overlay.is_deleted(SegmentId::new(2), 3));
        assert_eq!(overlay.deleted_count(SegmentId::new(1)), 1);
    }

    #[test]
    fn updates_merge_fields() {
        let overlay = PatchOverlay::new();
        let mut first = BTreeMap::new();
        first.insert("a".to_string(), "1".to_string());
        first.insert("b".to_string(), "1".to_string());
        let mut second = BTreeMap::new();
        second.insert("b".to_string(), "2".to_string());

        overlay.update(SegmentId::new(0), 0, &first);
        overlay.update(SegmentId::new(0), 0, &second);

        let fields = overlay.updated_fields(SegmentId::new(0), 0).unwrap();
        assert_eq!(fields["a"], "1");
        assert_eq!(fields["b"], "2");
    }

    #[test]
    fn fork_is_independent() {
        let overlay = PatchOverlay::new();
        overlay.delete(SegmentId::new(0), 0);
        let fork = overlay.fork();
        fork.delete(SegmentId::new(0), 1);

        assert!(fork.is_deleted(SegmentId::new(0), 0));
        assert!(!overlay.is_deleted(SegmentId::new(0), 1));
    }
}
