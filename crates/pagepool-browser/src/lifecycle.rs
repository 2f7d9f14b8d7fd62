//! Tie pool shutdown to process termination signals.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::launcher::WorkerLauncher;
use crate::pool::WorkerPool;

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(%e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

/// Destroy `pool` once `trigger` resolves.
pub fn destroy_on<L, F>(pool: Arc<WorkerPool<L>>, trigger: F) -> JoinHandle<()>
where
    L: WorkerLauncher,
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        trigger.await;
        pool.destroy().await;
    })
}

/// Destroy `pool` on Ctrl+C / SIGTERM.
pub fn destroy_on_shutdown<L: WorkerLauncher>(pool: Arc<WorkerPool<L>>) -> JoinHandle<()> {
    destroy_on(pool, shutdown_signal())
}
