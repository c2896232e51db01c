use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{AppError, Result};
use crate::workflow::types::WorkflowRecord;

/// Index of workflows currently in flight, keyed by issue number.
///
/// Entries are snapshots; the owning `process_issue` call refreshes them on
/// every transition. A std mutex is used so that deregistration can run from
/// `Drop`, which is how cleanup is guaranteed on every exit path, including
/// panics and dropped futures.
#[derive(Default)]
pub struct WorkflowRegistry {
    active: Mutex<HashMap<u64, WorkflowRecord>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, WorkflowRecord>> {
        // A panic while holding the lock cannot leave a map half-written.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a record unless its issue is already active.
    ///
    /// The returned guard removes the entry when dropped.
    pub fn register(self: &Arc<Self>, record: &WorkflowRecord) -> Result<Registration> {
        let issue_number = record.issue_number;
        {
            let mut entries = self.entries();
            if entries.contains_key(&issue_number) {
                return Err(AppError::DuplicateWorkflow(issue_number));
            }
            entries.insert(issue_number, record.clone());
        }

        tracing::debug!(issue = issue_number, "Workflow registered");

        Ok(Registration {
            registry: Arc::clone(self),
            issue_number,
            released: false,
        })
    }

    /// Remove an entry. Returns whether it was present.
    pub fn deregister(&self, issue_number: u64) -> bool {
        let removed = self.entries().remove(&issue_number).is_some();
        if removed {
            tracing::debug!(issue = issue_number, "Workflow deregistered");
        }
        removed
    }

    pub fn update(&self, record: &WorkflowRecord) {
        if let Some(entry) = self.entries().get_mut(&record.issue_number) {
            *entry = record.clone();
        }
    }

    /// Snapshot of every non-terminal workflow, ordered by issue number.
    pub fn active_workflows(&self) -> Vec<WorkflowRecord> {
        let mut records: Vec<_> = self.entries().values().cloned().collect();
        records.sort_by_key(|r| r.issue_number);
        records
    }
}

/// Ownership of one registry entry.
pub struct Registration {
    registry: Arc<WorkflowRegistry>,
    issue_number: u64,
    released: bool,
}

impl Registration {
    /// Refresh the registry snapshot, or release the entry once terminal.
    ///
    /// After release the issue number may be registered again, so the guard
    /// must not touch the registry afterwards.
    pub fn sync(&mut self, record: &WorkflowRecord) {
        if self.released {
            return;
        }
        if record.is_terminal() {
            self.registry.deregister(self.issue_number);
            self.released = true;
        } else {
            self.registry.update(record);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released {
            self.registry.deregister(self.issue_number);
        }
    }
}
