//! Hierarchical counters.
//!
//! Counters are addressed by dotted paths such as `offline.build.addDocCount`.
//! Accumulative counters only grow; state counters hold the latest observed
//! value (memory use, reader count).
//!
//! # Usage
//!
//! ```rust
//! use sediment_core::counter::{names, CounterMap};
//!
//! let counters = CounterMap::new();
//! counters.acc(names::ADD_DOC_COUNT).increment(1);
//! counters.state(names::BUILD_MEMORY_USE).set(4096);
//!
//! assert_eq!(counters.value(names::ADD_DOC_COUNT), Some(1));
//! ```

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Well-known counter paths.
pub mod names {
    /// Documents added by the offline builder.
    pub const ADD_DOC_COUNT: &str = "offline.build.addDocCount";
    /// Documents updated by the offline builder.
    pub const UPDATE_DOC_COUNT: &str = "offline.build.updateDocCount";
    /// Documents deleted by the offline builder.
    pub const DELETE_DOC_COUNT: &str = "offline.build.deleteDocCount";
    /// Documents dropped by the offline builder.
    pub const SKIP_DOC_COUNT: &str = "offline.build.skipDocCount";
    /// Segments dumped by the offline builder.
    pub const DUMP_SEGMENT_COUNT: &str = "offline.build.dumpSegmentCount";
    /// Documents that succeeded after a dump-and-retry.
    pub const RETRY_DOC_COUNT: &str = "offline.build.retryDocCount";
    /// Dumps forced by memory control.
    pub const FORCE_DUMP_COUNT: &str = "offline.build.forceDumpCount";
    /// Batches flushed by the document batcher.
    pub const BATCH_FLUSH_COUNT: &str = "offline.build.batchFlushCount";
    /// Building memory of the offline builder.
    pub const BUILD_MEMORY_USE: &str = "offline.build.memoryUse";
    /// Segments merged away.
    pub const MERGED_SEGMENT_COUNT: &str = "offline.merge.mergedSegmentCount";
    /// Work items skipped because a checkpoint existed.
    pub const MERGE_CHECKPOINT_SKIP_COUNT: &str = "offline.merge.checkpointSkipCount";

    /// Documents applied by the real-time writer.
    pub const ONLINE_BUILD_DOC_COUNT: &str = "online.build.docCount";
    /// Documents skipped by the real-time writer.
    pub const ONLINE_SKIP_DOC_COUNT: &str = "online.build.skipDocCount";
    /// Real-time segments dumped.
    pub const ONLINE_DUMP_SEGMENT_COUNT: &str = "online.build.dumpSegmentCount";
    /// Operations replayed by redo.
    pub const REDO_OPERATION_COUNT: &str = "online.redo.operationCount";
    /// Operations skipped by redo because the new version covers them.
    pub const REDO_SKIP_COUNT: &str = "online.redo.skipCount";
    /// Successful reopens.
    pub const REOPEN_COUNT: &str = "online.reopen.count";
    /// Reopens that degraded from normal to force.
    pub const REOPEN_FALLBACK_COUNT: &str = "online.reopen.forceFallbackCount";
    /// Real-time operations dropped by a force-open fallback.
    pub const DISCARDED_OPERATION_COUNT: &str = "online.reopen.discardedOperationCount";
    /// Readers evicted by the cleaner.
    pub const EVICTED_READER_COUNT: &str = "online.cleaner.evictedReaderCount";
    /// Memory held by the published reader.
    pub const READER_MEMORY_USE: &str = "online.reader.memoryUse";
    /// Memory held by in-memory real-time segments.
    pub const RT_MEMORY_USE: &str = "online.rt.memoryUse";
    /// Readers held by the reader container.
    pub const READER_COUNT: &str = "online.reader.count";
}

/// How a counter's value evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Monotonically increasing.
    Accumulative,
    /// Overwritten with the latest observation.
    State,
}

/// A single counter.
#[derive(Debug)]
pub struct Counter {
    kind: CounterKind,
    value: AtomicI64,
}

impl Counter {
    fn new(kind: CounterKind) -> Self {
        Self {
            kind,
            value: AtomicI64::new(0),
        }
    }

    /// Returns the counter kind.
    #[must_use]
    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    /// Adds `delta` to the counter.
    pub fn increment(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Overwrites the counter.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A registry of counters addressed by dotted paths.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct CounterMap {
    counters: RwLock<BTreeMap<String, Arc<Counter>>>,
}

impl CounterMap {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, path: &str, kind: CounterKind) -> Arc<Counter> {
        if let Some(counter) = self.counters.read().get(path) {
            if counter.kind != kind {
                warn!(path, expected = ?kind, actual = ?counter.kind, "counter kind mismatch");
            }
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(Counter::new(kind))),
        )
    }

    /// Returns the accumulative counter at `path`, creating it if needed.
    pub fn acc(&self, path: &str) -> Arc<Counter> {
        self.get_or_create(path, CounterKind::Accumulative)
    }

    /// Returns the state counter at `path`, creating it if needed.
    pub fn state(&self, path: &str) -> Arc<Counter> {
        self.get_or_create(path, CounterKind::State)
    }

    /// Returns the value at `path`, if the counter exists.
    #[must_use]
    pub fn value(&self, path: &str) -> Option<i64> {
        self.counters.read().get(path).map(|c| c.get())
    }

    /// Returns a flat snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters
            .read()
            .iter()
            .map(|(path, counter)| (path.clone(), counter.get()))
            .collect()
    }

    /// Returns the counters as a nested JSON object keyed by path segment.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (path, value) in self.snapshot() {
            let mut node = &mut root;
            let mut parts = path.split('.').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    node.insert(part.to_string(), Value::from(value));
                    break;
                }
                let child = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                match child {
                    Value::Object(map) => node = map,
                    _ => break,
                }
            }
        }
        Value::Object(root)
    }
}
