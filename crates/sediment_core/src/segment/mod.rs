//! Segments: the unit of indexed data.
//!
//! A segment starts as a [`BuildingSegment`] that accepts documents, is
//! frozen and dumped, and from then on is an immutable [`BuiltSegment`].
//!
//! ## Directory Layout
//!
//! ```text
//! segment_<id>/
//! ├─ data             # documents (JSON), written first
//! ├─ operation_log    # framed operation records
//! ├─ deletion_patch   # optional, cross-segment deletions
//! └─ segment_info     # metadata, committed last
//! ```

mod arena;
mod building;
mod built;
mod info;

pub use arena::SegmentArena;
pub use building::{Applied, BuildingSegment};
pub use built::BuiltSegment;
pub use info::{
    DeletionEntry, SegmentData, SegmentInfo, SegmentState, StoredDocument, DATA_FILE,
    DELETION_PATCH_FILE, OPERATION_LOG_FILE, SEGMENT_INFO_FILE,
};
