use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running totals of workflow outcomes since startup.
#[derive(Debug, Default)]
pub struct WorkflowStats {
    started: AtomicU64,
    completed: AtomicU64,
    not_feasible: AtomicU64,
    failed: AtomicU64,
    escalated: AtomicU64,
    workflow_timeouts: AtomicU64,
    rejected_duplicates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub not_feasible: u64,
    pub failed: u64,
    pub escalated: u64,
    pub workflow_timeouts: u64,
    pub rejected_duplicates: u64,
}

impl WorkflowStats {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_feasible(&self) {
        self.not_feasible.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalated(&self) {
        self.escalated.fetch_add(1, Ordering::Relaxed);
    }

    /// Counted in addition to `failed`.
    pub fn record_workflow_timeout(&self) {
        self.workflow_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_duplicate(&self) {
        self.rejected_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            not_feasible: self.not_feasible.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            workflow_timeouts: self.workflow_timeouts.load(Ordering::Relaxed),
            rejected_duplicates: self.rejected_duplicates.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Workflows that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.not_feasible + self.failed + self.escalated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = WorkflowStats::default();
        stats.record_started();
        stats.record_started();
        stats.record_completed();
        stats.record_failed();
        stats.record_workflow_timeout();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.finished(), 2);
        assert_eq!(snapshot.workflow_timeouts, 1);
        assert_eq!(snapshot.escalated, 0);
    }
}
