use std::sync::Arc;

use tokio::signal;

use crate::server::AppState;
use crate::workflow::monitor::MonitorHandle;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Stop the monitor and report workflows abandoned by the shutdown.
///
/// State is process-local, so in-flight workflows are lost; they are logged
/// so the issues can be resubmitted.
pub async fn graceful_shutdown(state: &Arc<AppState>, monitor: MonitorHandle) {
    tracing::info!("Starting graceful shutdown...");

    monitor.shutdown().await;

    let in_flight = state.orchestrator.active_workflows();
    if in_flight.is_empty() {
        tracing::info!("No in-flight workflows to abandon");
    } else {
        tracing::warn!(count = in_flight.len(), "Abandoning in-flight workflows");
        for record in &in_flight {
            tracing::warn!(
                issue = record.issue_number,
                state = %record.state,
                started_at = %record.started_at,
                "Workflow abandoned at shutdown"
            );
        }
    }

    let stats = state.orchestrator.stats();
    tracing::info!(
        started = stats.started,
        completed = stats.completed,
        failed = stats.failed,
        escalated = stats.escalated,
        abandoned = in_flight.len(),
        "Graceful shutdown complete"
    );
}
