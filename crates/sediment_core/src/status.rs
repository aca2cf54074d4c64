//! Status values returned at the public boundary.
//!
//! Internal code propagates [`CoreError`]; the builder and online partition
//! entry points translate errors into these enums so callers can branch on
//! the outcome without inspecting error variants.

use crate::error::CoreError;
use std::fmt;

/// Outcome of opening a builder or an online partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// Opened.
    Ok,
    /// Opening failed; the caller may retry.
    Fail,
    /// The memory quota does not fit the requested version.
    LackOfMemory,
    /// The on-disk state is inconsistent or corrupted.
    Inconsistent,
}

/// Outcome of a reopen request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReopenStatus {
    /// A new reader is published.
    Ok,
    /// Nothing changed.
    NoNeed,
    /// The reopen failed; the previous reader stays published and the call can be retried.
    Fail,
    /// The reopen cannot fit the memory budget.
    Unable,
    /// Real-time state was discarded and the partition reopened cold.
    ForceOpenFallback,
    /// The target version is older than the loaded one or missing.
    Invalid,
}

/// Outcome of a builder operation such as `end_index` or `merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Done.
    Ok,
    /// Nothing to do.
    NoNeed,
    /// The operation failed; the caller may retry.
    Fail,
    /// The builder is not accepting work.
    NotBuilding,
    /// On-disk state is inconsistent.
    Inconsistent,
}

impl From<&CoreError> for OpenStatus {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::LackOfMemory { .. } => Self::LackOfMemory,
            CoreError::InconsistentState { .. }
            | CoreError::Corruption { .. }
            | CoreError::ChecksumMismatch { .. } => Self::Inconsistent,
            _ => Self::Fail,
        }
    }
}

impl From<&CoreError> for BuildStatus {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::NotBuilding => Self::NotBuilding,
            CoreError::InconsistentState { .. }
            | CoreError::Corruption { .. }
            | CoreError::ChecksumMismatch { .. } => Self::Inconsistent,
            _ => Self::Fail,
        }
    }
}

impl fmt::Display for ReopenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::NoNeed => "no_need",
            Self::Fail => "fail",
            Self::Unable => "unable",
            Self::ForceOpenFallback => "force_open_fallback",
            Self::Invalid => "invalid",
        };
        f.write_str(name)
    }
}
