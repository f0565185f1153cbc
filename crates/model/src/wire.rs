//! Wire DTOs for the coordinator HTTP API (§6). Kept separate from the
//! domain types above so the domain model isn't shaped by transport
//! concerns (e.g. `Option` fields that only make sense on the wire).

use serde::{Deserialize, Serialize};

use crate::outcome::MetricsSnapshot;
use crate::quota::{GlobalBlockDescriptor, Quota};
use crate::settings::RuntimeSettings;
use crate::task::Task;

/// `GET /api/tasks/pull` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullTasksResponse {
    /// Claimed tasks, in claim order.
    pub tasks: Vec<Task>,
}

/// One entry of `POST /api/tasks/result/batch`'s body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// The task this result belongs to.
    pub task_id: u64,
    /// The worker that produced it.
    pub worker_id: String,
    /// Whether the task ultimately succeeded.
    pub success: bool,
    /// Opaque success payload (parsed fields), absent on failure.
    pub result: Option<serde_json::Value>,
    /// Classified error kind, absent on success. One of `timeout`,
    /// `network`, `blocked`, `captcha`, `parse_error`.
    pub error_type: Option<String>,
    /// Free-form error detail for observability.
    pub error_detail: Option<String>,
}

/// `POST /api/tasks/result/batch` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultsRequest {
    /// Results to submit, at most `batch_size` per request.
    pub results: Vec<TaskResult>,
}

/// `POST /api/tasks/release` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTasksRequest {
    /// Task ids to reset to `pending`.
    pub task_ids: Vec<u64>,
}

/// `POST /api/worker/sync` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// The reporting worker's id.
    pub worker_id: String,
    /// The worker's latest metrics snapshot, absent on the bootstrap sync.
    pub metrics: Option<MetricsSnapshot>,
}

/// `POST /api/worker/sync` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Full settings map and its version.
    pub settings: RuntimeSettings,
    /// This worker's computed quota.
    pub quota: Quota,
    /// Fleet-wide block descriptor, including this worker's jitter.
    pub block: GlobalBlockDescriptor,
}

/// Per-field validation failure reported by `PUT /api/settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldErrorDetail {
    /// Name of the offending field, or `"_cross_field"`.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

/// `GET /api/coordinator` read-only observability payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    /// Number of tasks currently pending.
    pub pending_tasks: u64,
    /// Number of tasks currently processing.
    pub processing_tasks: u64,
    /// Known, currently-active worker ids.
    pub active_workers: Vec<String>,
    /// Current settings version.
    pub settings_version: u64,
    /// Whether a global block cooldown is active right now.
    pub block_active: bool,
    /// Current block epoch.
    pub block_epoch: u64,
}
