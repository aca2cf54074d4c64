//! Batching of incoming documents.

use crate::config::BatchConfig;
use crate::document::Document;
use std::time::Instant;

/// Collects documents until one of the flush conditions holds.
///
/// A batch is flushed when it reaches `max_batch_size` documents, when its
/// estimated size exceeds `memory_pressure_ratio` of the free build quota, or
/// when the first document has waited longer than `max_collect_interval`.
/// Documents leave the batch in arrival order.
#[derive(Debug)]
pub struct DocumentBatcher {
    config: BatchConfig,
    docs: Vec<Document>,
    bytes: u64,
    started: Option<Instant>,
}

impl DocumentBatcher {
    /// Creates an empty batcher.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            docs: Vec::new(),
            bytes: 0,
            started: None,
        }
    }

    /// Adds a document with its estimated size.
    pub fn push(&mut self, doc: Document, estimated_size: u64) {
        self.started.get_or_insert_with(Instant::now);
        self.bytes += estimated_size;
        self.docs.push(doc);
    }

    /// Returns true if the batch must be flushed given `free_quota` bytes of
    /// build memory left.
    #[must_use]
    pub fn should_flush(&self, free_quota: u64) -> bool {
        if self.docs.is_empty() {
            return false;
        }
        self.docs.len() >= self.config.max_batch_size.max(1)
            || self.bytes as f64 >= free_quota as f64 * self.config.memory_pressure_ratio
            || self.is_expired()
    }

    /// Returns true if the oldest document waited past the collect interval.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.started
            .is_some_and(|t| t.elapsed() >= self.config.max_collect_interval())
    }

    /// Takes the collected documents.
    pub fn take(&mut self) -> Vec<Document> {
        self.bytes = 0;
        self.started = None;
        std::mem::take(&mut self.docs)
    }

    /// Documents collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true if no document is collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}
