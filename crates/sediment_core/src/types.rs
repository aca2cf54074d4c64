//! Core type definitions for sediment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Microsecond timestamp attached to documents and versions.
pub type Timestamp = i64;

/// Timestamp value meaning "not set".
pub const INVALID_TIMESTAMP: Timestamp = -1;

/// Document id local to one segment.
pub type DocId = u32;

/// Identifier for a segment.
///
/// Offline (incremental) segments use small ids. Real-time segments carry
/// [`SegmentId::RT_MASK`] so the two families never collide and real-time
/// segments always sort after offline ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl SegmentId {
    /// Bit set on every real-time segment id.
    pub const RT_MASK: u32 = 0x2000_0000;

    /// Creates a new segment ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the first real-time segment id.
    #[must_use]
    pub const fn first_realtime() -> Self {
        Self(Self::RT_MASK)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true if this is a real-time segment id.
    #[must_use]
    pub const fn is_realtime(self) -> bool {
        self.0 & Self::RT_MASK != 0
    }

    /// Returns the id `step` positions after this one.
    #[must_use]
    pub const fn advance(self, step: u32) -> Self {
        Self(self.0 + step)
    }

    /// Returns the directory name of this segment (`segment_<id>`).
    #[must_use]
    pub fn dir_name(self) -> String {
        format!("{SEGMENT_DIR_PREFIX}{}", self.0)
    }

    /// Parses a segment directory name.
    #[must_use]
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.strip_prefix(SEGMENT_DIR_PREFIX)?
            .parse::<u32>()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_realtime() {
            write!(f, "rt:{}", self.0 & !Self::RT_MASK)
        } else {
            write!(f, "seg:{}", self.0)
        }
    }
}

/// Prefix of segment directory names.
pub const SEGMENT_DIR_PREFIX: &str = "segment_";

/// Identifier for a committed version.
///
/// Version ids are monotonically increasing per partition directory.
/// [`VersionId::INITIAL`] names the empty version of a fresh partition and is
/// never written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u32);

impl VersionId {
    /// Id of the empty version.
    pub const INITIAL: Self = Self(0);

    /// Creates a new version ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next version id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the file name of this version (`version.<id>`).
    #[must_use]
    pub fn file_name(self) -> String {
        format!("{VERSION_FILE_PREFIX}{}", self.0)
    }

    /// Parses a version file name. Temporary files are rejected.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix(VERSION_FILE_PREFIX)?
            .parse::<u32>()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Prefix of version file names.
pub const VERSION_FILE_PREFIX: &str = "version.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_dir_names_round_trip() {
        let id = SegmentId::new(42);
        assert_eq!(id.dir_name(), "segment_42");
        assert_eq!(SegmentId::from_dir_name("segment_42"), Some(id));
        assert_eq!(SegmentId::from_dir_name("segment_x"), None);
        assert_eq!(SegmentId::from_dir_name("version.1"), None);
    }

    #[test]
    fn realtime_ids_sort_after_offline_ids() {
        let rt = SegmentId::first_realtime();
        assert!(rt.is_realtime());
        assert!(!SegmentId::new(1_000_000).is_realtime());
        assert!(SegmentId::new(1_000_000) < rt);
        assert_eq!(rt.to_string(), "rt:0");
    }

    #[test]
    fn version_file_names() {
        assert_eq!(VersionId::new(7).file_name(), "version.7");
        assert_eq!(VersionId::from_file_name("version.7"), Some(VersionId(7)));
        assert_eq!(VersionId::from_file_name("version.7.__tmp__"), None);
        assert_eq!(VersionId::INITIAL.next(), VersionId(1));
    }
}
