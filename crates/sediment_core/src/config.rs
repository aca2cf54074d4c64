//! Builder, merger and online partition configuration.
//!
//! Every config has sensible defaults, `#[must_use]` builder-style setters,
//! and a JSON form where omitted fields take their default.

use crate::error::CoreResult;
use crate::merger::ParallelBuildInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Document batching for the offline builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Whether documents are collected into batches before building.
    pub enabled: bool,
    /// Flush once this many documents are buffered.
    pub max_batch_size: usize,
    /// Flush once the oldest buffered document waited this long (milliseconds).
    pub max_collect_interval_ms: u64,
    /// Flush early once building memory crosses this fraction of the quota.
    pub memory_pressure_ratio: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: 64,
            max_collect_interval_ms: 1_000,
            memory_pressure_ratio: 0.8,
        }
    }
}

impl BatchConfig {
    /// Returns the collect interval.
    #[must_use]
    pub const fn max_collect_interval(&self) -> Duration {
        Duration::from_millis(self.max_collect_interval_ms)
    }
}

/// Merge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// A non-optimize merge keeps at most this many segments.
    pub max_segment_count: usize,
    /// Memory the scheduler may hand out to concurrently running work items.
    pub merge_memory_budget: u64,
    /// Worker threads used by the scheduler.
    pub merge_threads: usize,
    /// Persist a checkpoint after each completed work item.
    pub enable_checkpoint: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_segment_count: 4,
            merge_memory_budget: 256 * 1024 * 1024, // 256 MB
            merge_threads: 2,
            enable_checkpoint: true,
        }
    }
}

impl MergeConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment count a non-optimize merge converges to.
    #[must_use]
    pub const fn max_segment_count(mut self, count: usize) -> Self {
        self.max_segment_count = count;
        self
    }

    /// Sets the scheduler memory budget.
    #[must_use]
    pub const fn merge_memory_budget(mut self, bytes: u64) -> Self {
        self.merge_memory_budget = bytes;
        self
    }

    /// Sets the scheduler thread count.
    #[must_use]
    pub const fn merge_threads(mut self, threads: usize) -> Self {
        self.merge_threads = threads;
        self
    }

    /// Sets whether work items are checkpointed.
    #[must_use]
    pub const fn enable_checkpoint(mut self, value: bool) -> Self {
        self.enable_checkpoint = value;
        self
    }
}

/// Offline builder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Memory quota for building plus in-flight dumps.
    pub build_total_memory: u64,
    /// Documents a single building segment can hold.
    pub max_docs_per_segment: usize,
    /// Hand dumps to a background thread instead of dumping inline.
    pub enable_async_dump: bool,
    /// Period of the memory-control task (milliseconds).
    pub memory_control_interval_ms: u64,
    /// Start the memory-control and dump threads.
    pub enable_background_tasks: bool,
    /// Document batching.
    pub batch: BatchConfig,
    /// Committed versions to keep when cleaning.
    pub keep_version_count: usize,
    /// Run a merge as part of `end_index`.
    pub merge_on_end_index: bool,
    /// Merge settings.
    pub merge: MergeConfig,
    /// Set when this builder is one shard of a parallel build.
    pub parallel: Option<ParallelBuildInfo>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_total_memory: 64 * 1024 * 1024, // 64 MB
            max_docs_per_segment: 1_000_000,
            enable_async_dump: false,
            memory_control_interval_ms: 200,
            enable_background_tasks: true,
            batch: BatchConfig::default(),
            keep_version_count: 2,
            merge_on_end_index: false,
            merge: MergeConfig::default(),
            parallel: None,
        }
    }
}

impl BuildConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON config. Omitted fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a serialization error on malformed JSON.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the memory-control period.
    #[must_use]
    pub const fn memory_control_interval(&self) -> Duration {
        Duration::from_millis(self.memory_control_interval_ms)
    }

    /// Sets the build memory quota.
    #[must_use]
    pub const fn build_total_memory(mut self, bytes: u64) -> Self {
        self.build_total_memory = bytes;
        self
    }

    /// Sets the per-segment document limit.
    #[must_use]
    pub const fn max_docs_per_segment(mut self, docs: usize) -> Self {
        self.max_docs_per_segment = docs;
        self
    }

    /// Sets whether dumps run on a background thread.
    #[must_use]
    pub const fn enable_async_dump(mut self, value: bool) -> Self {
        self.enable_async_dump = value;
        self
    }

    /// Sets whether background threads are started.
    #[must_use]
    pub const fn enable_background_tasks(mut self, value: bool) -> Self {
        self.enable_background_tasks = value;
        self
    }

    /// Sets the number of versions kept by cleanup.
    #[must_use]
    pub const fn keep_version_count(mut self, count: usize) -> Self {
        self.keep_version_count = count;
        self
    }

    /// Sets whether `end_index` also merges.
    #[must_use]
    pub const fn merge_on_end_index(mut self, value: bool) -> Self {
        self.merge_on_end_index = value;
        self
    }

    /// Sets the batching configuration.
    #[must_use]
    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the merge configuration.
    #[must_use]
    pub fn merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    /// Marks this builder as one shard of a parallel build.
    #[must_use]
    pub fn parallel(mut self, info: ParallelBuildInfo) -> Self {
        self.parallel = Some(info);
        self
    }
}

/// Online partition configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// Upper bound on reader memory during a reopen.
    pub max_reopen_memory_use: u64,
    /// Time budget for the catch-up redo passes (milliseconds).
    pub max_redo_time_ms: u64,
    /// Stop catch-up passes once fewer operations than this remain.
    pub redo_catch_up_threshold: usize,
    /// Maximum catch-up passes before the final pass.
    pub max_redo_iterations: usize,
    /// Discard real-time state and reopen cold when a force reopen fails.
    pub enable_force_open: bool,
    /// Readers kept by the reader container.
    pub reader_container_capacity: usize,
    /// Period of the cleaner task (milliseconds).
    pub cleaner_interval_ms: u64,
    /// Period of the metrics report task (milliseconds).
    pub report_interval_ms: u64,
    /// Memory quota for real-time building and dumping segments.
    pub rt_memory_quota: u64,
    /// Fraction of the real-time quota that triggers a reclaim reopen.
    pub reclaim_reader_memory_ratio: f64,
    /// A normal reopen may drop at most this many segments.
    pub max_normal_reopen_removed_segments: usize,
    /// Start the cleaner, report and dump threads.
    pub enable_background_tasks: bool,
    /// Real-time writer settings.
    pub build: BuildConfig,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            max_reopen_memory_use: 1024 * 1024 * 1024, // 1 GB
            max_redo_time_ms: 10_000,
            redo_catch_up_threshold: 16,
            max_redo_iterations: 8,
            enable_force_open: true,
            reader_container_capacity: 4,
            cleaner_interval_ms: 1_000,
            report_interval_ms: 5_000,
            rt_memory_quota: 128 * 1024 * 1024, // 128 MB
            reclaim_reader_memory_ratio: 0.9,
            max_normal_reopen_removed_segments: 64,
            enable_background_tasks: true,
            build: BuildConfig::default(),
        }
    }
}

impl OnlineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON config. Omitted fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a serialization error on malformed JSON.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the redo time budget.
    #[must_use]
    pub const fn max_redo_time(&self) -> Duration {
        Duration::from_millis(self.max_redo_time_ms)
    }

    /// Returns the cleaner period.
    #[must_use]
    pub const fn cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.cleaner_interval_ms)
    }

    /// Returns the metrics report period.
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Sets the reopen memory bound.
    #[must_use]
    pub const fn max_reopen_memory_use(mut self, bytes: u64) -> Self {
        self.max_reopen_memory_use = bytes;
        self
    }

    /// Sets the redo time budget in milliseconds.
    #[must_use]
    pub const fn max_redo_time_ms(mut self, ms: u64) -> Self {
        self.max_redo_time_ms = ms;
        self
    }

    /// Sets the catch-up threshold.
    #[must_use]
    pub const fn redo_catch_up_threshold(mut self, ops: usize) -> Self {
        self.redo_catch_up_threshold = ops;
        self
    }

    /// Sets the catch-up iteration bound.
    #[must_use]
    pub const fn max_redo_iterations(mut self, iterations: usize) -> Self {
        self.max_redo_iterations = iterations;
        self
    }

    /// Sets whether a failed force reopen falls back to a cold open.
    #[must_use]
    pub const fn enable_force_open(mut self, value: bool) -> Self {
        self.enable_force_open = value;
        self
    }

    /// Sets the reader container capacity.
    #[must_use]
    pub const fn reader_container_capacity(mut self, capacity: usize) -> Self {
        self.reader_container_capacity = capacity;
        self
    }

    /// Sets the real-time memory quota.
    #[must_use]
    pub const fn rt_memory_quota(mut self, bytes: u64) -> Self {
        self.rt_memory_quota = bytes;
        self
    }

    /// Sets the removed-segment bound of a normal reopen.
    #[must_use]
    pub const fn max_normal_reopen_removed_segments(mut self, count: usize) -> Self {
        self.max_normal_reopen_removed_segments = count;
        self
    }

    /// Sets whether background threads are started.
    #[must_use]
    pub const fn enable_background_tasks(mut self, value: bool) -> Self {
        self.enable_background_tasks = value;
        self
    }

    /// Sets the real-time writer configuration.
    #[must_use]
    pub fn build(mut self, build: BuildConfig) -> Self {
        self.build = build;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BuildConfig::default();
        assert!(!config.enable_async_dump);
        assert!(!config.batch.enabled);
        assert!(config.parallel.is_none());
        assert_eq!(config.memory_control_interval(), Duration::from_millis(200));
    }

    #[test]
    fn builder_pattern() {
        let config = BuildConfig::new()
            .build_total_memory(1024)
            .max_docs_per_segment(10)
            .enable_async_dump(true)
            .merge(MergeConfig::new().max_segment_count(1));

        assert_eq!(config.build_total_memory, 1024);
        assert_eq!(config.max_docs_per_segment, 10);
        assert!(config.enable_async_dump);
        assert_eq!(config.merge.max_segment_count, 1);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = BuildConfig::from_json(r#"{"max_docs_per_segment": 3, "batch": {"enabled": true}}"#)
            .unwrap();
        assert_eq!(config.max_docs_per_segment, 3);
        assert!(config.batch.enabled);
        assert_eq!(config.batch.max_batch_size, BatchConfig::default().max_batch_size);
        assert_eq!(config.keep_version_count, 2);
    }

    #[test]
    fn online_json_round_trip() {
        let config = OnlineConfig::new().rt_memory_quota(77).enable_force_open(false);
        let json = serde_json::to_string(&config).unwrap();
        let parsed = OnlineConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
