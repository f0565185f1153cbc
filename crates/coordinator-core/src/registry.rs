//! Worker registry (§4.G / §3): created on first sync, refreshed on
//! every sync, garbage-collected after a long inactivity threshold.

use std::collections::HashMap;

use model::WorkerRegistration;

/// Window within which a worker counts as "active" for quota allocation
/// (§4.G step 1).
pub const ACTIVE_WINDOW_S: u64 = 60;
/// Threshold past which an unseen worker is evicted entirely (§4.G,
/// task sweep pass).
pub const EVICTION_THRESHOLD_S: u64 = 600;

/// Known workers, keyed by their self-chosen stable id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerRegistration>,
}

impl WorkerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { workers: HashMap::new() }
    }

    /// Records a sync from `worker_id` at `now`, creating the
    /// registration if this is the first time it's been seen.
    pub fn touch(&mut self, worker_id: &str, now: u64) {
        self.workers
            .entry(worker_id.to_string())
            .and_modify(|w| w.last_seen = now)
            .or_insert_with(|| WorkerRegistration::new(worker_id.to_string(), now));
    }

    /// Records cumulative outcome counters from a metrics report.
    pub fn record_counters(&mut self, worker_id: &str, success: u64, failure: u64, blocked: u64) {
        if let Some(w) = self.workers.get_mut(worker_id) {
            w.total_success += success;
            w.total_failure += failure;
            w.total_blocked += blocked;
        }
    }

    /// Ids of workers that synced within [`ACTIVE_WINDOW_S`] of `now`.
    #[must_use]
    pub fn active_ids(&self, now: u64) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| w.active_within(now, ACTIVE_WINDOW_S))
            .map(|w| w.worker_id.clone())
            .collect()
    }

    /// All known worker ids, active or not.
    #[must_use]
    pub fn all_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Removes workers unseen for more than [`EVICTION_THRESHOLD_S`].
    /// Returns the evicted ids, so callers can also drop their quota and
    /// per-worker metrics entries.
    pub fn evict_stale(&mut self, now: u64) -> Vec<String> {
        let stale: Vec<String> = self
            .workers
            .values()
            .filter(|w| !w.active_within(now, EVICTION_THRESHOLD_S))
            .map(|w| w.worker_id.clone())
            .collect();
        for id in &stale {
            let _ = self.workers.remove(id);
        }
        stale
    }

    /// Looks up one registration, for observability.
    #[must_use]
    pub fn get(&self, worker_id: &str) -> Option<&WorkerRegistration> {
        self.workers.get(worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_touch_creates_registration() {
        let mut registry = WorkerRegistry::new();
        registry.touch("w1", 100);
        let w = registry.get("w1").expect("registered");
        assert_eq!(w.first_seen, 100);
        assert_eq!(w.last_seen, 100);
    }

    #[test]
    fn active_ids_excludes_stale_workers() {
        let mut registry = WorkerRegistry::new();
        registry.touch("fresh", 1000);
        registry.touch("stale", 900);
        let active = registry.active_ids(1000 + ACTIVE_WINDOW_S + 1);
        assert!(active.is_empty());
        let active = registry.active_ids(1000 + 10);
        assert_eq!(active, vec!["fresh".to_string()]);
    }

    #[test]
    fn eviction_removes_long_silent_workers() {
        let mut registry = WorkerRegistry::new();
        registry.touch("ghost", 0);
        let evicted = registry.evict_stale(EVICTION_THRESHOLD_S + 1);
        assert_eq!(evicted, vec!["ghost".to_string()]);
        assert!(registry.get("ghost").is_none());
    }
}
