//! Build command implementation.

use sediment_core::{BuildConfig, BuildStatus, Document, IndexBuilder, ParallelBuildInfo, Timestamp, VersionId, VersionStore};
use sediment_storage::{Directory, FsDirectory};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Options of the build command.
#[derive(Debug)]
pub struct BuildOptions {
    /// JSON-lines input.
    pub input: PathBuf,
    /// Version timestamp.
    pub timestamp: Timestamp,
    /// Memory quota override.
    pub memory: Option<u64>,
    /// Segment size override.
    pub max_docs: Option<usize>,
    /// `<instance>/<count>` for a shard build.
    pub shard: Option<String>,
    /// Parallel build round.
    pub batch_id: u64,
}

/// Parses `<instance>/<count>`.
pub fn parse_shard(value: &str) -> Result<(u32, u32), Box<dyn std::error::Error>> {
    let (instance, count) = value
        .split_once('/')
        .ok_or_else(|| format!("shard must look like <instance>/<count>, got {value:?}"))?;
    Ok((instance.trim().parse()?, count.trim().parse()?))
}

/// Runs the build command.
pub fn run(path: &Path, mut config: BuildConfig, options: &BuildOptions) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(memory) = options.memory {
        config = config.build_total_memory(memory);
    }
    if let Some(max_docs) = options.max_docs {
        config = config.max_docs_per_segment(max_docs);
    }
    if let Some(shard) = &options.shard {
        let (instance, count) = parse_shard(shard)?;
        let root: Arc<dyn Directory> = Arc::new(FsDirectory::open(path)?);
        let base = VersionStore::new(root).latest_version_id()?.unwrap_or(VersionId::INITIAL);
        config = config.parallel(ParallelBuildInfo::new(count, instance, options.batch_id, base));
    }

    let builder = IndexBuilder::open_path(super::context(path), path, config)?;
    let reader = BufReader::new(File::open(&options.input)?);
    let (mut accepted, mut dropped) = (0usize, 0usize);
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document = match serde_json::from_str(&line) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping malformed document");
                dropped += 1;
                continue;
            }
        };
        if builder.build(doc) {
            accepted += 1;
        } else {
            dropped += 1;
        }
    }

    let status = builder.end_index(options.timestamp);
    let version = builder.version();
    let counters = builder.counters().to_json();
    builder.close();

    println!("Build finished: {status:?}");
    println!("  Documents built:   {accepted}");
    println!("  Documents dropped: {dropped}");
    println!("  Version:           {}", version.id());
    println!("  Segments:          {}", version.segments().len());
    println!("  Counters:          {counters}");
    match status {
        BuildStatus::Ok | BuildStatus::NoNeed => Ok(()),
        other => Err(format!("end_index finished with {other:?}").into()),
    }
}
