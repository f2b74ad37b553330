use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::window::WindowEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSettings {
    pub limit: usize,
    pub window: Duration,
    pub idle_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: usize,
    /// Requests inside the window once this one is accounted for.
    pub count: usize,
    pub remaining: usize,
    /// When the oldest counted request leaves the window.
    pub reset_at: Instant,
    pub retry_after: Duration,
}

/// Sliding-window log of accepted requests per client key.
///
/// Every operation runs under one exclusive lock over the whole map, so checks
/// for the same key are fully serialized and a sweep never observes a
/// half-updated entry.
#[derive(Debug)]
pub struct LimiterStore {
    settings: LimiterSettings,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl LimiterStore {
    pub fn new(settings: LimiterSettings) -> Self {
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> LimiterSettings {
        self.settings
    }

    pub fn record_and_check(&self, key: &str, now: Instant) -> Decision {
        let LimiterSettings {
            limit,
            window,
            idle_ttl,
        } = self.settings;

        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::new(now, idle_ttl));

        let count = entry.prune(now, window);

        let decision = if count >= limit {
            // limit == 0 leaves nothing counted; the caller is told to wait a full window.
            let reset_at = entry.oldest().unwrap_or(now) + window;
            Decision {
                allowed: false,
                limit,
                count,
                remaining: 0,
                reset_at,
                retry_after: reset_at.saturating_duration_since(now),
            }
        } else {
            entry.push(now);
            let reset_at = entry.oldest().unwrap_or(now) + window;
            Decision {
                allowed: true,
                limit,
                count: count + 1,
                remaining: limit - count - 1,
                reset_at,
                retry_after: Duration::ZERO,
            }
        };

        entry.touch(now, idle_ttl);

        tracing::trace!(
            key,
            allowed = decision.allowed,
            count = decision.count,
            remaining = decision.remaining,
            "rate limit evaluated"
        );

        decision
    }

    /// Removes idle entries and returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let window = self.settings.window;

        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_evictable(now, window));

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
