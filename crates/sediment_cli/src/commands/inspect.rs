//! Inspect command implementation.

use sediment_core::merger::{MERGE_META_DIR, PARALLEL_DIR_PREFIX};
use sediment_core::{SegmentInfo, VersionStore};
use sediment_storage::{Directory, FsDirectory};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Partition inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Partition path.
    pub path: String,
    /// Committed version ids, oldest first.
    pub versions: Vec<u32>,
    /// Latest version id.
    pub latest_version: Option<u32>,
    /// Upstream position of the latest version.
    pub locator: Option<String>,
    /// Timestamp of the latest version.
    pub timestamp: Option<i64>,
    /// Segment ids of the latest version.
    pub segment_ids: Vec<u32>,
    /// Live documents across those segments.
    pub doc_count: u64,
    /// Bytes of document data across those segments.
    pub byte_size: u64,
    /// Segment directories not listed by the latest version.
    pub unreferenced_segments: Vec<u32>,
    /// True if a merge plan is waiting to be resumed.
    pub merge_in_progress: bool,
    /// Parallel build shard directories.
    pub shards: Vec<String>,
    /// Segment details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentInfo>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_segments: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No partition found at {}", path.display()).into());
    }
    let result = inspect(path, show_segments)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result of the partition at `path`.
pub fn inspect(path: &Path, show_segments: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(path)?);
    let store = VersionStore::new(Arc::clone(&dir));
    let versions = store.list_versions()?;
    let latest = store.load_latest()?;

    let mut infos = Vec::new();
    if let Some(version) = &latest {
        for id in version.segments() {
            infos.push(SegmentInfo::load(dir.as_ref(), *id)?);
        }
    }
    let unreferenced_segments = store
        .segment_dirs()?
        .into_iter()
        .filter(|id| latest.as_ref().map_or(true, |v| !v.has_segment(*id)))
        .map(|id| id.as_u32())
        .collect();
    let shards = dir
        .list("")?
        .into_iter()
        .filter(|name| name.starts_with(PARALLEL_DIR_PREFIX))
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        versions: versions.iter().map(|v| v.as_u32()).collect(),
        latest_version: latest.as_ref().map(|v| v.id().as_u32()),
        locator: latest.as_ref().map(|v| v.locator().to_string()),
        timestamp: latest.as_ref().map(|v| v.timestamp()),
        segment_ids: infos.iter().map(|i| i.segment_id.as_u32()).collect(),
        doc_count: infos.iter().map(|i| i.doc_count).sum(),
        byte_size: infos.iter().map(|i| i.byte_size).sum(),
        unreferenced_segments,
        merge_in_progress: dir.exists(MERGE_META_DIR),
        shards,
        segments: show_segments.then_some(infos),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Partition: {}", result.path);
    println!();
    match result.latest_version {
        Some(id) => {
            println!("Latest version: {id}");
            println!("  Locator:   {}", result.locator.as_deref().unwrap_or("-"));
            println!("  Timestamp: {}", result.timestamp.unwrap_or(-1));
            println!("  Segments:  {:?}", result.segment_ids);
            println!("  Documents: {}", result.doc_count);
            println!("  Bytes:     {}", result.byte_size);
        }
        None => println!("No committed version"),
    }
    println!("Versions on disk: {:?}", result.versions);
    if !result.unreferenced_segments.is_empty() {
        println!("Unreferenced segments: {:?}", result.unreferenced_segments);
    }
    if result.merge_in_progress {
        println!("A merge is in progress and will resume on the next merge");
    }
    if !result.shards.is_empty() {
        println!("Parallel build shards: {}", result.shards.join(", "));
    }

    if let Some(segments) = &result.segments {
        println!();
        println!("Segments:");
        for info in segments {
            println!(
                "  {:>10}  docs={:<8} bytes={:<10} ops={:<8} locator={} merged={}",
                info.segment_id.to_string(),
                info.doc_count,
                info.byte_size,
                info.operation_count,
                info.locator,
                info.merged
            );
        }
    }
}
