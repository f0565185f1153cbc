//! Coordinator-side bookkeeping for known workers.

use serde::{Deserialize, Serialize};

/// A worker known to the coordinator, created on its first sync and
/// garbage-collected after an inactivity threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Worker-chosen stable id.
    pub worker_id: String,
    /// Unix seconds of the first sync received from this worker.
    pub first_seen: u64,
    /// Unix seconds of the most recent sync.
    pub last_seen: u64,
    /// Cumulative successful requests reported across all syncs.
    pub total_success: u64,
    /// Cumulative failed requests reported across all syncs.
    pub total_failure: u64,
    /// Cumulative blocked requests reported across all syncs.
    pub total_blocked: u64,
}

impl WorkerRegistration {
    /// A freshly registered worker seen for the first time at `now`.
    #[must_use]
    pub fn new(worker_id: String, now: u64) -> Self {
        Self {
            worker_id,
            first_seen: now,
            last_seen: now,
            total_success: 0,
            total_failure: 0,
            total_blocked: 0,
        }
    }

    /// Whether this worker reported within the last `window_s` seconds.
    #[must_use]
    pub fn active_within(&self, now: u64, window_s: u64) -> bool {
        now.saturating_sub(self.last_seen) <= window_s
    }
}
