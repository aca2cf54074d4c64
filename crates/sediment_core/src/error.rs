//! Error types for sediment core.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the index lifecycle.
///
/// Public entry points that return a status enum (see [`crate::status`]) map
/// these errors onto the status instead of propagating them.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Directory error.
    #[error("storage error: {0}")]
    Storage(#[from] sediment_storage::StorageError),

    /// I/O error outside of the directory abstraction.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error for versions, segment infos and configs.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// On-disk state contradicts itself (version ids, parallel shards, segments).
    #[error("inconsistent state: {message}")]
    InconsistentState {
        /// Description of the inconsistency.
        message: String,
    },

    /// A caller supplied an invalid argument.
    #[error("bad parameter: {message}")]
    BadParameter {
        /// Description of the bad parameter.
        message: String,
    },

    /// The building segment has no room for another document.
    #[error("building segment {segment_id} is out of space")]
    OutOfMemory {
        /// The full segment.
        segment_id: u32,
    },

    /// A memory quota would be exceeded.
    #[error("lack of memory: required {required} bytes, available {available} bytes")]
    LackOfMemory {
        /// Bytes required by the operation.
        required: u64,
        /// Bytes still available under the quota.
        available: u64,
    },

    /// A time budget was exhausted.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// The operation that ran out of time.
        operation: &'static str,
        /// Time spent before giving up.
        elapsed: Duration,
    },

    /// The requested operation is not supported by this table.
    #[error("not supported: {message}")]
    NotSupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// The builder is not accepting documents.
    #[error("builder is not in building state")]
    NotBuilding,

    /// A persisted file is corrupted.
    #[error("corruption in {file}: {message}")]
    Corruption {
        /// The file that failed to decode.
        file: String,
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// The partition directory is locked by another process.
    #[error("partition locked: another process has exclusive access")]
    PartitionLocked,

    /// The component was closed.
    #[error("{component} is closed")]
    Closed {
        /// The closed component.
        component: &'static str,
    },
}

impl CoreError {
    /// Creates an inconsistent state error.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::InconsistentState {
            message: message.into(),
        }
    }

    /// Creates a bad parameter error.
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter {
            message: message.into(),
        }
    }

    /// Creates a not supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Creates a corruption error for `file`.
    pub fn corruption(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Creates a closed error.
    pub fn closed(component: &'static str) -> Self {
        Self::Closed { component }
    }

    /// Returns true if retrying the same call later may succeed.
    ///
    /// Memory and time budget failures, and transient I/O, are retryable.
    /// Corruption and inconsistent state are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Io(_)
                | Self::LackOfMemory { .. }
                | Self::Timeout { .. }
                | Self::OutOfMemory { .. }
        )
    }

    /// Returns true if this error is a memory or time budget failure.
    ///
    /// A normal reopen that fails this way degrades to a force reopen.
    #[must_use]
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, Self::LackOfMemory { .. } | Self::Timeout { .. })
    }

    /// Returns true if the error means a named file does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_not_found(),
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
