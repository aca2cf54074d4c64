//! Per-segment operation logs.
//!
//! Every document a writer applies is also recorded as an [`Operation`] in
//! the log of the segment it was built into. Logs serve two purposes:
//!
//! - Loading a version replays each segment's log against older segments,
//!   which is how deletes and updates of documents in older segments persist
//! - Reopening an online partition redoes real-time operations against the
//!   newly loaded version
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Payload: `origin (4) | seq (8) | src (8) | offset (8) | timestamp (8) | pk`,
//! followed for updates by `field_count (4)` and the fields. Strings are
//! length-prefixed (4 bytes, little endian).

mod log;
mod reader;
mod record;

pub use log::{encode_operations, OperationLog};
pub use reader::{decode_operations, OperationLogReader};
pub use record::{Operation, OperationKind, OperationType, OPLOG_MAGIC, OPLOG_VERSION};
