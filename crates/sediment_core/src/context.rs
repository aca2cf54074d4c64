//! Engine context: schema plus the table-specific strategy.
//!
//! Table kinds differ in how they rewrite incoming documents and whether
//! they accept more documents after `end_index`. Those decisions live behind
//! [`TableStrategy`]; the lifecycle code only talks to the trait.

use crate::config::{BuildConfig, MergeConfig};
use crate::document::{Document, DocumentKind};
use crate::error::{CoreError, CoreResult};
use crate::merger::IndexPartitionMerger;
use crate::partition_data::PartitionData;
use crate::builder::{DumpQueue, PartitionWriter, WriterMode};
use crate::counter::CounterMap;
use sediment_storage::Directory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Table name.
    pub name: String,
    /// Schema generation. A change forces a full reopen.
    #[serde(default)]
    pub schema_id: u32,
    /// Fields an update document may change. Empty means all fields.
    #[serde(default)]
    pub updatable_fields: BTreeSet<String>,
    /// Whether the builder may keep building after `end_index`.
    #[serde(default = "default_streaming")]
    pub streaming_build: bool,
}

const fn default_streaming() -> bool {
    true
}

impl Schema {
    /// Creates a schema with every field updatable.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_id: 0,
            updatable_fields: BTreeSet::new(),
            streaming_build: true,
        }
    }

    /// Sets the schema generation.
    #[must_use]
    pub const fn with_schema_id(mut self, schema_id: u32) -> Self {
        self.schema_id = schema_id;
        self
    }

    /// Restricts updates to the given fields.
    #[must_use]
    pub fn with_updatable_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.updatable_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets whether building may continue after `end_index`.
    #[must_use]
    pub const fn with_streaming_build(mut self, value: bool) -> Self {
        self.streaming_build = value;
        self
    }

    /// Returns true if `field` may be changed by an update.
    #[must_use]
    pub fn is_updatable(&self, field: &str) -> bool {
        self.updatable_fields.is_empty() || self.updatable_fields.contains(field)
    }
}

/// Table-specific behavior plugged into the lifecycle.
pub trait TableStrategy: Send + Sync + fmt::Debug {
    /// Short name of the table kind.
    fn table_type(&self) -> &'static str;

    /// Returns true if documents may be built after `end_index`.
    fn accepts_streaming_build(&self, schema: &Schema) -> bool {
        schema.streaming_build
    }

    /// Validates and normalizes a document.
    ///
    /// Returns `Ok(None)` when the document has no effect and should be skipped.
    fn rewrite(&self, schema: &Schema, doc: Document) -> CoreResult<Option<Document>>;

    /// Estimated bytes one document adds to a building segment.
    fn estimate_doc_memory(&self, doc: &Document) -> u64 {
        doc.estimated_size()
    }

    /// Returns true if a parallel merge must synthesize a reconciliation segment.
    fn needs_shard_reconcile_segment(&self) -> bool {
        false
    }
}

/// Primary-key table: empty keys are rejected and updates are filtered to
/// the schema's updatable fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalTableStrategy {
    reconcile_shards: bool,
}

impl NormalTableStrategy {
    /// Creates the default strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reconcile_shards: false,
        }
    }

    /// Makes parallel merges write a reconciliation segment.
    #[must_use]
    pub const fn with_shard_reconcile(mut self, value: bool) -> Self {
        self.reconcile_shards = value;
        self
    }
}

impl TableStrategy for NormalTableStrategy {
    fn table_type(&self) -> &'static str {
        "normal"
    }

    fn rewrite(&self, schema: &Schema, mut doc: Document) -> CoreResult<Option<Document>> {
        if doc.pk.is_empty() {
            return Err(CoreError::bad_parameter(format!(
                "{} document without primary key",
                doc.kind.as_str()
            )));
        }
        match doc.kind {
            DocumentKind::Add => Ok(Some(doc)),
            DocumentKind::Delete => {
                doc.fields.clear();
                Ok(Some(doc))
            }
            DocumentKind::Update => {
                doc.fields.retain(|name, _| schema.is_updatable(name));
                if doc.fields.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(doc))
                }
            }
        }
    }

    fn needs_shard_reconcile_segment(&self) -> bool {
        self.reconcile_shards
    }
}

/// Shared engine state handed to builders, mergers and online partitions.
#[derive(Debug, Clone)]
pub struct EngineContext {
    schema: Schema,
    strategy: Arc<dyn TableStrategy>,
}

impl EngineContext {
    /// Creates a context.
    pub fn new(schema: Schema, strategy: Arc<dyn TableStrategy>) -> Self {
        Self { schema, strategy }
    }

    /// Creates a context for a normal primary-key table.
    pub fn normal(schema: Schema) -> Self {
        Self::new(schema, Arc::new(NormalTableStrategy::new()))
    }

    /// Returns the schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the table strategy.
    #[must_use]
    pub fn strategy(&self) -> &Arc<dyn TableStrategy> {
        &self.strategy
    }

    /// Creates an offline writer over `data` that dumps into `dir`.
    pub fn create_writer(
        self: &Arc<Self>,
        dir: Arc<dyn Directory>,
        data: PartitionData,
        config: &BuildConfig,
        dump_queue: Arc<DumpQueue>,
        counters: Arc<CounterMap>,
    ) -> CoreResult<PartitionWriter> {
        PartitionWriter::new(
            Arc::clone(self),
            dir,
            data,
            config,
            WriterMode::Offline,
            dump_queue,
            counters,
        )
    }

    /// Creates a merger over `dir`.
    pub fn create_merger(
        self: &Arc<Self>,
        dir: Arc<dyn Directory>,
        config: MergeConfig,
        keep_version_count: usize,
        counters: Arc<CounterMap>,
    ) -> IndexPartitionMerger {
        IndexPartitionMerger::new(Arc::clone(self), dir, config, keep_version_count, counters)
    }
}
