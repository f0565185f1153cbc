//! Task records owned exclusively by the coordinator.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Claimable by a worker.
    Pending,
    /// Claimed by a worker; carries an attribution and freshness invariant
    /// enforced by the coordinator's sweep, not by this type.
    Processing,
    /// Terminal success.
    Done,
    /// Terminal failure (retries exhausted).
    Failed,
}

/// A unit of scrape work. Ids are coordinator-assigned and monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Monotonic, coordinator-assigned id.
    pub id: u64,
    /// Opaque batch name the task belongs to.
    pub batch: String,
    /// Opaque catalog item id (e.g. ASIN).
    pub item_id: String,
    /// Free-form task parameters (url template args, locale, etc).
    pub params: serde_json::Value,
    /// Higher values preempt. Zero is normal priority.
    pub priority: i32,
    /// Whether a screenshot should be captured (out of scope here; carried
    /// through for the external renderer to consume).
    pub screenshot: bool,
    /// Number of attempts already made across all workers.
    pub retry_count: u32,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Worker id currently owning this task, if `state == Processing`.
    pub owner: Option<String>,
    /// Unix seconds of last state transition.
    pub updated_at: u64,
}

impl Task {
    /// True once retries have hit the configured ceiling.
    #[must_use]
    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}
