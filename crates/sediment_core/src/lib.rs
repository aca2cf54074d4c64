//! # Sediment Core
//!
//! Version and segment lifecycle of an embedded index partition.
//!
//! This crate provides:
//! - [`IndexBuilder`] - offline building: admission, dumping, versions
//! - [`IndexPartitionMerger`] - checkpointed, resumable segment merges
//! - [`ParallelPartitionDataMerger`] - joining the shards of a parallel build
//! - [`OnlinePartition`] - serving readers while real-time documents arrive,
//!   and reopening onto newer versions
//!
//! ## Layout of a partition directory
//!
//! ```text
//! <partition>/
//! ├─ version.0, version.1, ...   # committed versions (JSON)
//! ├─ segment_0/, segment_1/, ... # built segments
//! ├─ merge_meta/                 # in-progress merge plan and checkpoints
//! └─ parallel_0/, parallel_1/    # parallel build shards
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sediment_core::{BuildConfig, BuildStatus, Document, EngineContext, IndexBuilder, Schema};
//! use sediment_storage::{Directory, InMemoryDirectory};
//!
//! let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
//! let ctx = Arc::new(EngineContext::normal(Schema::new("docs")));
//! let config = BuildConfig::default().enable_background_tasks(false);
//! let builder = IndexBuilder::open(ctx, dir, config).unwrap();
//!
//! assert!(builder.build(Document::add("doc-1").field("title", "hello")));
//! assert_eq!(builder.end_index(100), BuildStatus::Ok);
//! assert_eq!(builder.version().segments().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod background;
pub mod builder;
pub mod config;
pub mod context;
pub mod counter;
pub mod document;
pub mod error;
pub mod locator;
#[cfg(feature = "std")]
pub mod lock;
pub mod merger;
pub mod online;
pub mod oplog;
pub mod partition_data;
pub mod reader;
pub mod segment;
pub mod status;
pub mod types;
pub mod version;

pub use background::{BackgroundTask, TaskGroup, TaskMessage};
pub use builder::{BuilderState, IndexBuilder, PartitionWriter, WriterMode};
pub use config::{BatchConfig, BuildConfig, MergeConfig, OnlineConfig};
pub use context::{EngineContext, NormalTableStrategy, Schema, TableStrategy};
pub use counter::{Counter, CounterKind, CounterMap};
pub use document::{Document, DocumentKind};
pub use error::{CoreError, CoreResult};
pub use locator::Locator;
#[cfg(feature = "std")]
pub use lock::DirectoryLock;
pub use merger::{IndexPartitionMerger, MergePlan, ParallelBuildInfo, ParallelPartitionDataMerger};
pub use online::{OnlinePartition, PartitionStatus, ReopenType};
pub use partition_data::{PartitionData, SegmentHandle};
pub use reader::{DocumentView, PartitionReader, ReaderContainer};
pub use segment::{BuildingSegment, BuiltSegment, SegmentInfo};
pub use status::{BuildStatus, OpenStatus, ReopenStatus};
pub use types::{DocId, SegmentId, Timestamp, VersionId, INVALID_TIMESTAMP};
pub use version::{Version, VersionStore};
