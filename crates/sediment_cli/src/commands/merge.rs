//! Merge and parallel-merge command implementations.

use sediment_core::{BuildConfig, BuildStatus, CounterMap, DirectoryLock, IndexBuilder, ParallelPartitionDataMerger, Timestamp};
use sediment_storage::{Directory, FsDirectory};
use std::path::Path;
use std::sync::Arc;

/// Runs the merge command.
pub fn run(path: &Path, config: BuildConfig, optimize: bool, timestamp: Timestamp) -> Result<(), Box<dyn std::error::Error>> {
    let builder = IndexBuilder::open_path(super::context(path), path, config.enable_background_tasks(false))?;
    let before = builder.version();
    let status = builder.merge(optimize, timestamp);
    let after = builder.version();
    builder.close();

    match status {
        BuildStatus::Ok => {
            println!("Merged version {} into version {}", before.id(), after.id());
            println!("  Segments before: {}", before.segments().len());
            println!("  Segments after:  {}", after.segments().len());
            Ok(())
        }
        BuildStatus::NoNeed => {
            println!("Nothing to merge in version {}", before.id());
            Ok(())
        }
        other => Err(format!("merge finished with {other:?}").into()),
    }
}

/// Runs the parallel-merge command.
pub fn run_parallel(path: &Path, config: &BuildConfig) -> Result<(), Box<dyn std::error::Error>> {
    let _lock = DirectoryLock::acquire(path)?;
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(path)?);
    let merger = ParallelPartitionDataMerger::new(
        super::context(path),
        dir,
        config.keep_version_count,
        Arc::new(CounterMap::new()),
    );
    match merger.merge()? {
        Some(version) => {
            println!("Committed version {}", version.id());
            println!("  Segments: {:?}", version.segments().iter().map(|s| s.as_u32()).collect::<Vec<_>>());
        }
        None => println!("No shards to merge"),
    }
    Ok(())
}
