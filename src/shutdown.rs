//! Cleanup on process termination signals.

use tokio::task::JoinHandle;

use crate::backend::Connector;
use crate::manager::PoolManager;

/// Resolves on Ctrl-C (SIGINT) or, on Unix, SIGTERM.
///
/// If a handler cannot be installed the corresponding signal is ignored and
/// the other one still works.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

/// Wait for a termination signal, then run `cleanup()` within the
/// configured `shutdown_grace`.
pub async fn cleanup_on_signal<C: Connector>(manager: PoolManager<C>) {
    shutdown_signal().await;
    cleanup_with_grace(&manager).await;
}

/// Run [`cleanup_on_signal`] on a background task. Await the handle before
/// the process exits.
pub fn spawn_cleanup_on_signal<C: Connector>(manager: PoolManager<C>) -> JoinHandle<()> {
    tokio::spawn(cleanup_on_signal(manager))
}

pub(crate) async fn cleanup_with_grace<C: Connector>(manager: &PoolManager<C>) {
    let grace = manager.config().shutdown_grace;
    if tokio::time::timeout(grace, manager.cleanup()).await.is_err() {
        tracing::warn!(grace_ms = grace.as_millis() as u64, "pool cleanup exceeded grace period");
    }
}
