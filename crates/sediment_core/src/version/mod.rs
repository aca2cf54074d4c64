//! Versions: immutable snapshots of which segments form a partition.
//!
//! A version is never edited after it is created. [`Version::edit`] returns
//! a [`VersionEditor`] seeded with a copy of the version and the successor
//! id; the editor produces the next version.
//!
//! ## File Format
//!
//! `version.<id>` holds JSON:
//!
//! ```json
//! {"version_id": 3, "segments": [0, 2, 5], "locator": {"src": 0, "offset": 41},
//!  "timestamp": 1700, "schema_version": 0, "format_version": 2, "description": {}}
//! ```
//!
//! Every field except `version_id` may be absent (older writers used
//! `segment_ids` for `segments`); absent fields take defaults.

mod store;

pub use store::{CleanResult, VersionStore};

use crate::error::{CoreError, CoreResult};
use crate::locator::Locator;
use crate::types::{SegmentId, Timestamp, VersionId, INVALID_TIMESTAMP};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Version format written by this crate.
pub const CURRENT_VERSION_FORMAT: u32 = 2;

/// An immutable, ordered set of segment ids plus stream progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    version_id: VersionId,
    #[serde(default, alias = "segment_ids")]
    segments: Vec<SegmentId>,
    #[serde(default)]
    locator: Locator,
    #[serde(default = "invalid_timestamp")]
    timestamp: Timestamp,
    #[serde(default)]
    schema_version: u32,
    #[serde(default = "legacy_format")]
    format_version: u32,
    #[serde(default)]
    description: BTreeMap<String, String>,
}

const fn invalid_timestamp() -> Timestamp {
    INVALID_TIMESTAMP
}

const fn legacy_format() -> u32 {
    1
}

impl Version {
    /// The empty version of a fresh partition.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version_id: VersionId::INITIAL,
            segments: Vec::new(),
            locator: Locator::UNKNOWN,
            timestamp: INVALID_TIMESTAMP,
            schema_version: 0,
            format_version: CURRENT_VERSION_FORMAT,
            description: BTreeMap::new(),
        }
    }

    /// Returns the version id.
    #[must_use]
    pub fn id(&self) -> VersionId {
        self.version_id
    }

    /// Returns the segment ids in version order.
    #[must_use]
    pub fn segments(&self) -> &[SegmentId] {
        &self.segments
    }

    /// Returns the stream progress covered by this version.
    #[must_use]
    pub fn locator(&self) -> Locator {
        self.locator
    }

    /// Returns the version timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the schema generation.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Returns the on-disk format generation.
    #[must_use]
    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    /// Returns the free-form description.
    #[must_use]
    pub fn description(&self) -> &BTreeMap<String, String> {
        &self.description
    }

    /// Returns true if `id` is part of this version.
    #[must_use]
    pub fn has_segment(&self, id: SegmentId) -> bool {
        self.segments.contains(&id)
    }

    /// Returns the largest segment id, if any.
    #[must_use]
    pub fn max_segment_id(&self) -> Option<SegmentId> {
        self.segments.iter().max().copied()
    }

    /// Returns true if the version has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Starts editing a successor of this version.
    #[must_use]
    pub fn edit(&self) -> VersionEditor {
        let mut next = self.clone();
        next.version_id = self.version_id.next();
        next.format_version = CURRENT_VERSION_FORMAT;
        VersionEditor { version: next }
    }

    /// Segments added and removed going from `base` to `self`.
    #[must_use]
    pub fn diff(&self, base: &Version) -> VersionDiff {
        let old: BTreeSet<_> = base.segments.iter().copied().collect();
        let new: BTreeSet<_> = self.segments.iter().copied().collect();
        VersionDiff {
            added: new.difference(&old).copied().collect(),
            removed: old.difference(&new).copied().collect(),
        }
    }

    /// Checks that `self` may be committed after `base`.
    ///
    /// The id must be larger, and every segment of `base` is either still
    /// present or listed in `replaced` (merged away).
    pub fn check_successor(&self, base: &Version, replaced: &[SegmentId]) -> CoreResult<()> {
        if self.version_id <= base.version_id {
            return Err(CoreError::inconsistent(format!(
                "version {} does not follow {}",
                self.version_id, base.version_id
            )));
        }
        if let Some(lost) = base
            .segments
            .iter()
            .find(|id| !self.has_segment(**id) && !replaced.contains(id))
        {
            return Err(CoreError::inconsistent(format!(
                "version {} drops segment {lost} of {}",
                self.version_id, base.version_id
            )));
        }
        Ok(())
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses a version file.
    ///
    /// # Errors
    ///
    /// Returns a corruption error naming `file` if the JSON is malformed or
    /// lists a segment twice.
    pub fn from_json(file: &str, bytes: &[u8]) -> CoreResult<Self> {
        let version: Self =
            serde_json::from_slice(bytes).map_err(|e| CoreError::corruption(file, e.to_string()))?;
        let mut seen = BTreeSet::new();
        if let Some(dup) = version.segments.iter().find(|id| !seen.insert(**id)) {
            return Err(CoreError::corruption(file, format!("segment {dup} listed twice")));
        }
        Ok(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.version_id)?;
        for (i, id) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", id.as_u32())?;
        }
        write!(f, "] @ {}", self.locator)
    }
}

/// Difference between two versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDiff {
    /// Segments only in the newer version.
    pub added: Vec<SegmentId>,
    /// Segments only in the older version.
    pub removed: Vec<SegmentId>,
}

/// Builds the successor of a version.
#[derive(Debug, Clone)]
pub struct VersionEditor {
    version: Version,
}

impl VersionEditor {
    /// Overrides the id of the version being built.
    #[must_use]
    pub fn with_id(mut self, id: VersionId) -> Self {
        self.version.version_id = id;
        self
    }

    /// Appends a segment. Adding a present segment is a no-op.
    pub fn add_segment(&mut self, id: SegmentId) -> &mut Self {
        if !self.version.segments.contains(&id) {
            self.version.segments.push(id);
        }
        self
    }

    /// Removes a segment.
    pub fn remove_segment(&mut self, id: SegmentId) -> &mut Self {
        self.version.segments.retain(|s| *s != id);
        self
    }

    /// Sets the locator.
    pub fn set_locator(&mut self, locator: Locator) -> &mut Self {
        self.version.locator = locator;
        self
    }

    /// Advances the locator to cover `locator` too.
    pub fn advance_locator(&mut self, locator: Locator) -> &mut Self {
        self.version.locator = self.version.locator.advance(locator);
        self
    }

    /// Sets the timestamp.
    pub fn set_timestamp(&mut self, timestamp: Timestamp) -> &mut Self {
        self.version.timestamp = timestamp;
        self
    }

    /// Sets the schema generation.
    pub fn set_schema_version(&mut self, schema_version: u32) -> &mut Self {
        self.version.schema_version = schema_version;
        self
    }

    /// Sets a description entry.
    pub fn describe(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.version.description.insert(key.to_string(), value.into());
        self
    }

    /// Returns true if the version being built lists `id`.
    #[must_use]
    pub fn has_segment(&self, id: SegmentId) -> bool {
        self.version.has_segment(id)
    }

    /// Finishes editing.
    #[must_use]
    pub fn build(&self) -> Version {
        self.version.clone()
    }
}
