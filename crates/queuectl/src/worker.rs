//! `queuectl worker run`: a single worker process.

use std::path::Path;
use std::sync::Arc;

use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use queuectl_store::SqliteJobStore;
use queuectl_worker::{Worker, WorkerConfig};

/// Run the poll loop until SIGTERM or Ctrl-C.
///
/// Failing to open the store is fatal; once running, store errors are retried.
pub async fn run(db: &Path, config: WorkerConfig) -> Result<()> {
    let store = SqliteJobStore::open(db)
        .map_err(|e| miette::miette!("worker could not open job store: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(pid = std::process::id(), db = %db.display(), "worker process started");
    Worker::new(Arc::new(store), config).run(shutdown_rx).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = terminate.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C will stop this worker");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    tokio::signal::ctrl_c().await.ok();
}
