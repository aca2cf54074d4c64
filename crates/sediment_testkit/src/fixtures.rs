//! Test fixtures and partition helpers.
//!
//! Provides partitions backed by memory or a temporary directory, with
//! builders and online partitions wired to the same storage.

use sediment_core::segment::SegmentArena;
use sediment_core::{
    BuildConfig, BuildStatus, Document, EngineContext, IndexBuilder, Locator, OnlineConfig, OnlinePartition,
    PartitionData, PartitionReader, Schema, Timestamp, Version, VersionStore,
};
use sediment_storage::{Directory, FsDirectory, InMemoryDirectory};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Source id used by [`at`].
pub const TEST_SOURCE: u64 = 0;

/// A test partition with automatic cleanup.
///
/// `dir` holds the built versions; `rt_dir` is where an online partition
/// dumps real-time segments.
#[derive(Debug)]
pub struct TestPartition {
    /// Directory holding versions and built segments.
    pub dir: Arc<dyn Directory>,
    /// Directory holding dumped real-time segments.
    pub rt_dir: Arc<dyn Directory>,
    ctx: Arc<EngineContext>,
    _temp_dir: Option<TempDir>,
}

impl TestPartition {
    /// Creates a partition over in-memory directories.
    pub fn memory() -> Self {
        Self {
            dir: Arc::new(InMemoryDirectory::new()),
            rt_dir: Arc::new(InMemoryDirectory::new()),
            ctx: Arc::new(EngineContext::normal(Schema::new("test"))),
            _temp_dir: None,
        }
    }

    /// Creates a partition in a temporary directory.
    ///
    /// Real-time segments go to an `rt` directory next to the partition.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let dir = FsDirectory::open(&temp_dir.path().join("partition")).expect("Failed to open partition directory");
        let rt_dir = FsDirectory::open(&temp_dir.path().join("rt")).expect("Failed to open rt directory");
        Self {
            dir: Arc::new(dir),
            rt_dir: Arc::new(rt_dir),
            ctx: Arc::new(EngineContext::normal(Schema::new("test"))),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Replaces the schema used by builders and online partitions.
    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.ctx = Arc::new(EngineContext::normal(schema));
        self
    }

    /// Replaces the partition directory, e.g. with a fault-injecting wrapper.
    #[must_use]
    pub fn with_directory(mut self, dir: Arc<dyn Directory>) -> Self {
        self.dir = dir;
        self
    }

    /// Returns the partition path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("partition"))
    }

    /// Returns the engine context.
    pub fn context(&self) -> Arc<EngineContext> {
        Arc::clone(&self.ctx)
    }

    /// Opens an offline builder over the partition.
    pub fn builder(&self, config: BuildConfig) -> IndexBuilder {
        IndexBuilder::open(self.context(), Arc::clone(&self.dir), config).expect("Failed to open builder")
    }

    /// Creates an online partition over the partition. It still has to be opened.
    pub fn online(&self, config: OnlineConfig) -> OnlinePartition {
        OnlinePartition::new(self.context(), config, Arc::clone(&self.dir), Arc::clone(&self.rt_dir))
    }

    /// Builds `docs` offline and commits a version stamped `timestamp`.
    pub fn build_version(&self, docs: impl IntoIterator<Item = Document>, timestamp: Timestamp) -> Arc<Version> {
        let builder = self.builder(quiet_build_config());
        for doc in docs {
            assert!(builder.build(doc), "document was dropped");
        }
        let status = builder.end_index(timestamp);
        assert!(
            matches!(status, BuildStatus::Ok | BuildStatus::NoNeed),
            "end_index finished with {status:?}"
        );
        let version = builder.version();
        builder.close();
        version
    }

    /// Loads the latest committed version.
    pub fn latest_version(&self) -> Option<Version> {
        VersionStore::new(Arc::clone(&self.dir))
            .load_latest()
            .expect("Failed to load latest version")
    }

    /// Opens a reader on the latest committed version.
    pub fn latest_reader(&self) -> PartitionReader {
        let version = self.latest_version().unwrap_or_else(Version::empty);
        let mut arena = SegmentArena::new();
        let data = PartitionData::load(self.dir.as_ref(), Arc::new(version), &mut arena)
            .expect("Failed to load partition data");
        PartitionReader::open(data)
    }
}

/// A build configuration without background threads.
pub fn quiet_build_config() -> BuildConfig {
    BuildConfig::default().enable_background_tasks(false)
}

/// An online configuration without background threads.
pub fn quiet_online_config() -> OnlineConfig {
    OnlineConfig::default()
        .enable_background_tasks(false)
        .build(quiet_build_config())
}

/// Stamps `doc` with offset `offset` of [`TEST_SOURCE`].
pub fn at(doc: Document, offset: i64) -> Document {
    doc.with_locator(Locator::new(TEST_SOURCE, offset))
}

/// Runs a test with a temporary in-memory partition.
///
/// # Example
///
/// ```rust
/// use sediment_core::Document;
/// use sediment_testkit::{at, with_temp_partition};
///
/// with_temp_partition(|partition| {
///     let version = partition.build_version([at(Document::add("a"), 1)], 10);
///     assert_eq!(version.segments().len(), 1);
/// });
/// ```
pub fn with_temp_partition<F, R>(f: F) -> R
where
    F: FnOnce(&TestPartition) -> R,
{
    let partition = TestPartition::memory();
    f(&partition)
}

/// Runs a test with a partition in a temporary directory.
pub fn with_file_partition<F, R>(f: F) -> R
where
    F: FnOnce(&TestPartition, &Path) -> R,
{
    let partition = TestPartition::file();
    let path = partition.path().expect("File partition should have a path");
    f(&partition, &path)
}

/// Writes `items` as JSON lines to `path`.
pub fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for item in items {
        serde_json::to_writer(&mut file, item)?;
        file.write_all(b"\n")?;
    }
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_partition_builds_versions() {
        let partition = TestPartition::memory();
        let version = partition.build_version([at(Document::add("a").field("f", "1"), 3)], 5);
        assert_eq!(version.locator(), Locator::new(TEST_SOURCE, 3));
        assert_eq!(partition.latest_version().unwrap().id(), version.id());
        assert_eq!(partition.latest_reader().lookup("a").unwrap().fields["f"], "1");
    }

    #[test]
    fn file_partition_has_path() {
        with_file_partition(|partition, path| {
            partition.build_version([Document::add("a")], 1);
            assert!(path.join("version.1").exists());
        });
    }

    #[test]
    fn writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("docs.jsonl");
        write_jsonl(&path, &[Document::add("a"), Document::add("b")]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        let doc: Document = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(doc.pk, "a");
    }
}
