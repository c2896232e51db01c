use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::workflow::orchestrator::WorkflowOrchestrator;

/// Owner of the background monitor task.
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Workflow monitor ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Periodically log in-flight workflows and outcome totals.
pub fn spawn_monitor(orchestrator: Arc<WorkflowOrchestrator>, interval: Duration) -> MonitorHandle {
    let (stop, mut stopped) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        tracing::info!(interval_secs = interval.as_secs(), "Workflow monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => report(&orchestrator),
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Workflow monitor stopped");
    });

    MonitorHandle { stop, task }
}

fn report(orchestrator: &WorkflowOrchestrator) {
    let expired = orchestrator.prune_failure_streaks();
    if expired > 0 {
        tracing::debug!(expired, "Forgot stale failure streaks");
    }

    let active = orchestrator.active_workflows();
    let stats = orchestrator.stats();

    tracing::info!(
        active = active.len(),
        started = stats.started,
        completed = stats.completed,
        not_feasible = stats.not_feasible,
        failed = stats.failed,
        escalated = stats.escalated,
        workflow_timeouts = stats.workflow_timeouts,
        tracked_streaks = orchestrator.tracked_streaks(),
        "Workflow monitor"
    );

    let budget = orchestrator.config().max_workflow_time();
    let now = Utc::now();
    for record in active {
        let running = (now - record.started_at).to_std().unwrap_or_default();
        if running > budget {
            tracing::warn!(
                issue = record.issue_number,
                state = %record.state,
                running_secs = running.as_secs(),
                "Workflow running past its deadline"
            );
        } else {
            tracing::debug!(
                issue = record.issue_number,
                state = %record.state,
                running_secs = running.as_secs(),
                "Workflow in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::MockCollaborator;
    use crate::collaborators::Collaborators;
    use crate::config::OrchestratorConfig;

    #[tokio::test(start_paused = true)]
    async fn test_monitor_runs_until_shutdown() {
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            OrchestratorConfig::default(),
            Collaborators::from_shared(Arc::new(MockCollaborator::happy())),
        ));

        let handle = spawn_monitor(Arc::clone(&orchestrator), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("monitor should stop promptly");
    }
}
