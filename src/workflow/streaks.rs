use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Streak {
    count: u32,
    updated: Instant,
}

/// Consecutive stage failures per issue, carried across submissions.
///
/// Entries expire once they have not been touched for `window`, and the
/// table never holds more than `capacity` issues; the least recently
/// updated entry is evicted first.
#[derive(Debug)]
pub struct FailureStreaks {
    entries: HashMap<u64, Streak>,
    window: Duration,
    capacity: usize,
}

impl FailureStreaks {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            window,
            capacity: capacity.max(1),
        }
    }

    /// Current streak for an issue; expired entries read as zero.
    pub fn get(&self, issue_number: u64, now: Instant) -> u32 {
        self.entries
            .get(&issue_number)
            .filter(|streak| !self.is_expired(streak, now))
            .map(|streak| streak.count)
            .unwrap_or(0)
    }

    /// Store the streak an issue finished with. Zero removes the entry.
    pub fn set(&mut self, issue_number: u64, count: u32, now: Instant) {
        if count == 0 {
            self.entries.remove(&issue_number);
            return;
        }

        self.entries.insert(
            issue_number,
            Streak {
                count,
                updated: now,
            },
        );
        self.prune(now);
    }

    /// Drop expired entries, then the oldest ones until within capacity.
    /// Returns how many entries were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let window = self.window;
        self.entries
            .retain(|_, streak| now.saturating_duration_since(streak.updated) < window);

        if self.entries.len() > self.capacity {
            let mut by_age: Vec<(u64, Instant)> = self
                .entries
                .iter()
                .map(|(issue, streak)| (*issue, streak.updated))
                .collect();
            by_age.sort_by_key(|(issue, updated)| (*updated, *issue));
            let excess = self.entries.len() - self.capacity;
            for (issue, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&issue);
            }
        }

        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_expired(&self, streak: &Streak, now: Instant) -> bool {
        now.saturating_duration_since(streak.updated) >= self.window
    }
}
