//! Documents accepted by the builders.

use crate::locator::Locator;
use crate::types::{Timestamp, INVALID_TIMESTAMP};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed per-document bookkeeping cost used by memory estimates.
pub const DOCUMENT_OVERHEAD: u64 = 64;

/// What a document asks the index to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Insert, replacing any previous document with the same primary key.
    Add,
    /// Change some fields of an existing document.
    Update,
    /// Remove a document.
    Delete,
}

impl DocumentKind {
    /// Returns the name used in logs and counters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A document together with its stream position.
///
/// The JSON form (one document per line) is what the CLI reads:
///
/// ```json
/// {"op":"add","pk":"doc-1","fields":{"title":"hello"},"locator":{"src":0,"offset":1},"timestamp":10}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Operation kind.
    #[serde(rename = "op")]
    pub kind: DocumentKind,
    /// Primary key.
    pub pk: String,
    /// Field values. Empty for deletes.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Upstream position of this document.
    #[serde(default)]
    pub locator: Locator,
    /// Event time.
    #[serde(default = "invalid_timestamp")]
    pub timestamp: Timestamp,
}

const fn invalid_timestamp() -> Timestamp {
    INVALID_TIMESTAMP
}

impl Document {
    fn with_kind(kind: DocumentKind, pk: impl Into<String>) -> Self {
        Self {
            kind,
            pk: pk.into(),
            fields: BTreeMap::new(),
            locator: Locator::UNKNOWN,
            timestamp: INVALID_TIMESTAMP,
        }
    }

    /// Creates an add document.
    pub fn add(pk: impl Into<String>) -> Self {
        Self::with_kind(DocumentKind::Add, pk)
    }

    /// Creates an update document.
    pub fn update(pk: impl Into<String>) -> Self {
        Self::with_kind(DocumentKind::Update, pk)
    }

    /// Creates a delete document.
    pub fn delete(pk: impl Into<String>) -> Self {
        Self::with_kind(DocumentKind::Delete, pk)
    }

    /// Sets a field value.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets the locator.
    #[must_use]
    pub const fn with_locator(mut self, locator: Locator) -> Self {
        self.locator = locator;
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Estimated bytes this document occupies once indexed.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        let fields: usize = self.fields.iter().map(|(k, v)| k.len() + v.len()).sum();
        DOCUMENT_OVERHEAD + (self.pk.len() + fields) as u64
    }

    /// Applies the document to a building segment.
    ///
    /// Shorthand for [`crate::segment::BuildingSegment::apply`].
    pub fn apply_to(
        &self,
        segment: &crate::segment::BuildingSegment,
        estimated_size: u64,
    ) -> crate::error::CoreResult<crate::segment::Applied> {
        segment.apply(self, estimated_size)
    }
}
