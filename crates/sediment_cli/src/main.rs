//! Sediment CLI
//!
//! Command-line tools for sediment index partitions.
//!
//! # Commands
//!
//! - `build` - Build documents from a JSON-lines file and commit a version
//! - `merge` - Merge the segments of the latest version
//! - `parallel-merge` - Join the shards of a parallel build
//! - `inspect` - Display versions and segments
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use sediment_core::{Timestamp, INVALID_TIMESTAMP};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Sediment command-line partition tools.
#[derive(Parser)]
#[command(name = "sediment")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the partition directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Build configuration file (JSON)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build documents from a JSON-lines file
    Build {
        /// Input file, one document per line
        #[arg(short, long)]
        input: PathBuf,

        /// Timestamp recorded in the committed version
        #[arg(short, long, default_value_t = INVALID_TIMESTAMP)]
        timestamp: Timestamp,

        /// Build memory quota in bytes
        #[arg(short, long)]
        memory: Option<u64>,

        /// Documents per segment
        #[arg(long)]
        max_docs: Option<usize>,

        /// Build as shard `<instance>/<count>` of a parallel build
        #[arg(long)]
        shard: Option<String>,

        /// Parallel build round
        #[arg(long, default_value_t = 0)]
        batch_id: u64,
    },

    /// Merge the segments of the latest version
    Merge {
        /// Merge every segment into one
        #[arg(short, long)]
        optimize: bool,

        /// Timestamp recorded in the merged version
        #[arg(short, long, default_value_t = INVALID_TIMESTAMP)]
        timestamp: Timestamp,
    },

    /// Join the shards of a parallel build into the partition
    ParallelMerge,

    /// Display versions and segments
    Inspect {
        /// Show segment details
        #[arg(short, long)]
        segments: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Build {
            input,
            timestamp,
            memory,
            max_docs,
            shard,
            batch_id,
        } => {
            let path = cli.path.ok_or("Partition path required for build")?;
            let options = commands::build::BuildOptions {
                input,
                timestamp,
                memory,
                max_docs,
                shard,
                batch_id,
            };
            commands::build::run(&path, config, &options)?;
        }
        Commands::Merge { optimize, timestamp } => {
            let path = cli.path.ok_or("Partition path required for merge")?;
            commands::merge::run(&path, config, optimize, timestamp)?;
        }
        Commands::ParallelMerge => {
            let path = cli.path.ok_or("Partition path required for parallel-merge")?;
            commands::merge::run_parallel(&path, &config)?;
        }
        Commands::Inspect { segments, format } => {
            let path = cli.path.ok_or("Partition path required for inspect")?;
            commands::inspect::run(&path, segments, &format)?;
        }
        Commands::Version => {
            println!("Sediment CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Sediment Core v{}", sediment_core::VERSION);
        }
    }

    Ok(())
}
