use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Accepted request instants for one client key, oldest first.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    timestamps: VecDeque<Instant>,
    idle_deadline: Instant,
}

impl WindowEntry {
    pub fn new(now: Instant, idle_ttl: Duration) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(4),
            idle_deadline: now + idle_ttl,
        }
    }

    /// Drops every timestamp at or before `now - window` and returns how many remain.
    pub fn prune(&mut self, now: Instant, window: Duration) -> usize {
        // Early in the process lifetime `now - window` may not exist; nothing is stale yet.
        if let Some(cutoff) = now.checked_sub(window) {
            while let Some(front) = self.timestamps.front().copied() {
                if front <= cutoff {
                    self.timestamps.pop_front();
                } else {
                    break;
                }
            }
        }

        self.timestamps.len()
    }

    pub fn oldest(&self) -> Option<Instant> {
        self.timestamps.front().copied()
    }

    pub fn push(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    pub fn touch(&mut self, now: Instant, idle_ttl: Duration) {
        self.idle_deadline = now + idle_ttl;
    }

    pub fn is_evictable(&mut self, now: Instant, window: Duration) -> bool {
        self.prune(now, window) == 0 && self.idle_deadline <= now
    }
}
