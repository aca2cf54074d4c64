//! CLI command implementations.

pub mod build;
pub mod inspect;
pub mod merge;

use sediment_core::{BuildConfig, EngineContext, Schema};
use std::path::Path;
use std::sync::Arc;

/// Loads the build configuration, or the defaults without a file.
pub fn load_config(path: Option<&Path>) -> Result<BuildConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            Ok(BuildConfig::from_json(&json)?)
        }
        None => Ok(BuildConfig::default()),
    }
}

/// Engine context for a partition named after its directory.
pub fn context(path: &Path) -> Arc<EngineContext> {
    let name = path
        .file_name()
        .map_or_else(|| "partition".to_string(), |n| n.to_string_lossy().into_owned());
    Arc::new(EngineContext::normal(Schema::new(name)))
}
