//! # Sediment Testkit
//!
//! Test utilities for the sediment index.
//!
//! This crate provides:
//! - Partition fixtures over memory or a temporary directory
//! - Property-based document generators using proptest
//! - A fault-injecting directory for interrupted merges and commits
//!
//! End-to-end scenarios covering build, merge, parallel merge and online
//! reopen live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust
//! use sediment_core::{Document, OpenStatus};
//! use sediment_testkit::prelude::*;
//!
//! with_temp_partition(|partition| {
//!     partition.build_version([at(Document::add("a"), 1)], 10);
//!     let online = partition.online(quiet_online_config());
//!     assert_eq!(online.open(None), OpenStatus::Ok);
//!     assert!(online.reader().unwrap().lookup("a").is_some());
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fault;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fault::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fault::*;
pub use fixtures::*;
pub use generators::*;
