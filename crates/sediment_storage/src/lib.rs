//! # Sediment Storage
//!
//! Directory abstraction for the sediment index engine.
//!
//! A [`Directory`] is a flat namespace of named blobs. Names are relative,
//! `/`-separated paths such as `segment_3/segment_info`. Directories do not
//! interpret what they store; the engine owns every file format.
//!
//! ## Design Principles
//!
//! - Blobs are written whole (`store`) or appended (`append`)
//! - `commit` is atomic: readers observe either the old blob or the new one
//! - Must be `Send + Sync`; engine components share one directory
//! - Failures surface as [`StorageError`], never as silent data loss
//!
//! ## Available Directories
//!
//! - [`InMemoryDirectory`] - For testing and ephemeral partitions
//! - [`FsDirectory`] - Persistent storage on the local file system
//! - [`SubDirectory`] - A prefixed view into another directory
//!
//! ## Example
//!
//! ```rust
//! use sediment_storage::{Directory, InMemoryDirectory};
//!
//! let dir = InMemoryDirectory::new();
//! dir.commit("version.0", b"{}").unwrap();
//! assert!(dir.exists("version.0"));
//! assert_eq!(dir.load("version.0").unwrap(), b"{}");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod directory;
mod error;
mod fs;
mod memory;

pub use directory::{join, Directory, SubDirectory};
pub use error::{StorageError, StorageResult};
pub use fs::FsDirectory;
pub use memory::InMemoryDirectory;
