use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use storages::{daemon, StorageConfig};

/// Index and serve named storage mounts
#[derive(Parser, Debug)]
#[command(name = "storaged", version, about)]
struct Args {
    /// SQLite file for the search index (overrides STORAGE_INDEX_PATH)
    #[arg(long)]
    index_path: Option<PathBuf>,

    /// Minutes between full reindex passes (overrides STORAGE_REINDEX_MINUTES)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    reindex_minutes: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match StorageConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = args.index_path {
        config.index_path = path;
    }
    if let Some(minutes) = args.reindex_minutes {
        config.reindex_interval = Duration::from_secs(minutes * 60);
    }

    match daemon::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Storage daemon failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
