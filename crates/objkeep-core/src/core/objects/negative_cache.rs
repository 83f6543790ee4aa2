use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Object ids the server recently reported as absent. Expired entries are
/// swept on insert, at most once per TTL.
#[derive(Debug)]
pub struct NegativeCache {
    entries: DashMap<String, Instant>,
    ttl: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new(NEGATIVE_CACHE_TTL)
    }
}

impl NegativeCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            last_sweep: Mutex::new(None),
        }
    }

    pub fn is_known_missing(&self, id: &str) -> bool {
        self.is_known_missing_at(id, Instant::now())
    }

    /// Fresh entries answer true; an expired entry is dropped.
    pub fn is_known_missing_at(&self, id: &str, now: Instant) -> bool {
        let Some(recorded) = self.entries.get(id).map(|entry| *entry.value()) else {
            return false;
        };
        if now.saturating_duration_since(recorded) < self.ttl {
            return true;
        }
        self.entries
            .remove_if(id, |_, recorded_at| now.saturating_duration_since(*recorded_at) >= self.ttl);
        false
    }

    pub fn record_missing(&self, id: &str) {
        self.record_missing_at(id, Instant::now());
    }

    pub fn record_missing_at(&self, id: &str, now: Instant) {
        self.sweep_expired(now);
        self.entries.insert(id.to_string(), now);
    }

    fn sweep_expired(&self, now: Instant) {
        {
            let mut last_sweep = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if last_sweep.is_some_and(|at| now.saturating_duration_since(at) < self.ttl) {
                return;
            }
            *last_sweep = Some(now);
        }
        self.entries
            .retain(|_, recorded| now.saturating_duration_since(*recorded) < self.ttl);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
