//! Long-running storage daemon
//!
//! Owns the [`StorageService`], runs the periodic reindex loop and stops
//! cleanly on Ctrl+C or SIGTERM.

use std::time::Duration;

use crate::filesystem::config::StorageConfig;
use crate::filesystem::StorageService;
use crate::protocol::StorageResult;

/// How long to wait for the scheduler loop after asking it to stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Start the daemon and block until a shutdown signal arrives
pub async fn run(config: StorageConfig) -> StorageResult<()> {
    let service = StorageService::new(config)?;
    tracing::info!(
        "Index database at {}, full reindex every {:?}",
        service.config().index_path.display(),
        service.config().reindex_interval
    );
    for storage in service.list_storages() {
        tracing::info!(
            "Storage {} at {} (mounted: {}, {} bytes free)",
            storage.name,
            storage.path,
            storage.is_mounted,
            storage.free_size
        );
    }

    let indexer = service.start_indexing();

    #[cfg(unix)]
    wait_for_shutdown_unix().await;

    #[cfg(not(unix))]
    wait_for_ctrlc().await;

    service.shutdown();
    if tokio::time::timeout(SHUTDOWN_GRACE, indexer).await.is_err() {
        tracing::warn!("Index scheduler did not stop within {:?}", SHUTDOWN_GRACE);
    }
    Ok(())
}

/// SIGTERM or Ctrl+C, whichever comes first
#[cfg(unix)]
async fn wait_for_shutdown_unix() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(
                "Failed to set up SIGTERM handler: {:?}. Only Ctrl+C will work for shutdown.",
                e
            );
            wait_for_ctrlc().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Daemon shutting down (Ctrl+C)");
        }
        _ = sigterm.recv() => {
            tracing::info!("Daemon shutting down (SIGTERM)");
        }
    }
}

async fn wait_for_ctrlc() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Daemon shutting down (Ctrl+C)");
}
