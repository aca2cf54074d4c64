//! Segment metadata and on-disk data layout.

use crate::error::{CoreError, CoreResult};
use crate::locator::Locator;
use crate::types::{DocId, SegmentId, Timestamp, INVALID_TIMESTAMP};
use sediment_storage::{join, Directory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata file written last when a segment is dumped.
pub const SEGMENT_INFO_FILE: &str = "segment_info";
/// Document data file.
pub const DATA_FILE: &str = "data";
/// Operation log file.
pub const OPERATION_LOG_FILE: &str = "operation_log";
/// Optional cross-segment deletion list.
pub const DELETION_PATCH_FILE: &str = "deletion_patch";

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Accepting documents.
    Building,
    /// Frozen, queued or being written.
    Dumping,
    /// Persisted and immutable.
    Built,
}

/// Persisted metadata of a built segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment id.
    pub segment_id: SegmentId,
    /// Live documents stored in the segment.
    pub doc_count: u64,
    /// Approximate bytes of document data.
    #[serde(default)]
    pub byte_size: u64,
    /// Operations in the segment's log.
    #[serde(default)]
    pub operation_count: u64,
    /// Schema generation the segment was built with.
    #[serde(default)]
    pub schema_id: u32,
    /// Furthest upstream position included.
    #[serde(default)]
    pub locator: Locator,
    /// Newest document timestamp included.
    #[serde(default = "invalid_timestamp")]
    pub timestamp: Timestamp,
    /// True if the segment is the output of a merge.
    #[serde(default)]
    pub merged: bool,
    /// Parallel build shard that produced the segment.
    #[serde(default)]
    pub shard: Option<u32>,
}

const fn invalid_timestamp() -> Timestamp {
    INVALID_TIMESTAMP
}

impl SegmentInfo {
    /// Creates metadata for an empty segment.
    #[must_use]
    pub fn new(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            doc_count: 0,
            byte_size: 0,
            operation_count: 0,
            schema_id: 0,
            locator: Locator::UNKNOWN,
            timestamp: INVALID_TIMESTAMP,
            merged: false,
            shard: None,
        }
    }

    /// Path of `file` inside the segment directory.
    #[must_use]
    pub fn path(segment_id: SegmentId, file: &str) -> String {
        join(&segment_id.dir_name(), file)
    }

    /// Loads the metadata of segment `segment_id` from `dir`.
    pub fn load(dir: &dyn Directory, segment_id: SegmentId) -> CoreResult<Self> {
        let name = Self::path(segment_id, SEGMENT_INFO_FILE);
        let bytes = dir.load(&name)?;
        let info: Self = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::corruption(name.clone(), e.to_string()))?;
        if info.segment_id != segment_id {
            return Err(CoreError::corruption(
                name,
                format!("segment info names {}", info.segment_id),
            ));
        }
        Ok(info)
    }

    /// Atomically writes the metadata. This marks the segment complete.
    pub fn commit(&self, dir: &dyn Directory) -> CoreResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        dir.commit(&Self::path(self.segment_id, SEGMENT_INFO_FILE), &bytes)?;
        Ok(())
    }
}

/// A document as stored inside a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Primary key.
    pub pk: String,
    /// Field values.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Upstream position of the add that wrote the document. In-place
    /// updates leave it unchanged.
    #[serde(default)]
    pub locator: Locator,
    /// Event time.
    #[serde(default = "invalid_timestamp")]
    pub timestamp: Timestamp,
}

impl StoredDocument {
    /// Approximate bytes of the document.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        let fields: usize = self.fields.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.pk.len() + fields) as u64
    }
}

/// Contents of the `data` file.
///
/// `deleted` lists documents superseded inside the same segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentData {
    /// Documents in local doc id order.
    pub docs: Vec<StoredDocument>,
    /// Local doc ids superseded within the segment.
    #[serde(default)]
    pub deleted: Vec<DocId>,
}

/// A document in another segment deleted by a deletion patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletionEntry {
    /// Segment holding the document.
    pub segment_id: SegmentId,
    /// Local doc id.
    pub doc_id: DocId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_storage::InMemoryDirectory;

    #[test]
    fn info_commit_and_load() {
        let dir = InMemoryDirectory::new();
        let mut info = SegmentInfo::new(SegmentId::new(3));
        info.doc_count = 12;
        info.locator = Locator::new(1, 99);
        info.commit(&dir).unwrap();

        assert!(dir.exists("segment_3/segment_info"));
        assert_eq!(SegmentInfo::load(&dir, SegmentId::new(3)).unwrap(), info);
    }

    #[test]
    fn info_with_wrong_id_is_corruption() {
        let dir = InMemoryDirectory::new();
        SegmentInfo::new(SegmentId::new(3)).commit(&dir).unwrap();
        dir.rename("segment_3", "segment_4").unwrap();

        let err = SegmentInfo::load(&dir, SegmentId::new(4)).unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
    }

    #[test]
    fn legacy_info_fills_defaults() {
        let info: SegmentInfo =
            serde_json::from_str(r#"{"segment_id": 1, "doc_count": 2}"#).unwrap();
        assert!(info.locator.is_unknown());
        assert_eq!(info.timestamp, INVALID_TIMESTAMP);
        assert!(!info.merged);
    }
}
