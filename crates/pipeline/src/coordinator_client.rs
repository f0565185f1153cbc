//! The worker's view of the coordinator's task-facing HTTP API (§6):
//! pull, result submission, and release. The sync exchange (§4.H) is a
//! separate concern, owned by the `worker-sync` crate.

use async_trait::async_trait;
use model::wire::{PullTasksResponse, ReleaseTasksRequest, SubmitResultsRequest, TaskResult};
use model::Task;

/// Errors talking to the coordinator's task API.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The HTTP request itself failed (connect, timeout, decode).
    #[error("coordinator request failed: {reason}")]
    Request {
        /// Human-readable failure detail.
        reason: String,
    },
}

/// The coordinator's task-facing surface, as the feeder, processing
/// loop, and result submitter depend on it.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Atomically claims up to `count` pending tasks.
    async fn pull_tasks(&self, worker_id: &str, count: u32) -> Result<Vec<Task>, Error>;

    /// Submits a batch of results.
    async fn submit_results(&self, results: Vec<TaskResult>) -> Result<(), Error>;

    /// Resets the given task ids back to `pending`.
    async fn release_tasks(&self, task_ids: Vec<u64>) -> Result<(), Error>;
}

/// `reqwest`-backed [`CoordinatorClient`].
pub struct HttpCoordinatorClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCoordinatorClient {
    /// Creates a client talking to `base_url` (no trailing slash).
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn pull_tasks(&self, worker_id: &str, count: u32) -> Result<Vec<Task>, Error> {
        let url = format!("{}/api/tasks/pull", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("worker_id", worker_id), ("count", &count.to_string())])
            .send()
            .await
            .map_err(|e| Error::Request { reason: e.to_string() })?;
        let parsed: PullTasksResponse = response
            .json()
            .await
            .map_err(|e| Error::Request { reason: e.to_string() })?;
        Ok(parsed.tasks)
    }

    async fn submit_results(&self, results: Vec<TaskResult>) -> Result<(), Error> {
        let url = format!("{}/api/tasks/result/batch", self.base_url);
        let _ = self
            .client
            .post(url)
            .json(&SubmitResultsRequest { results })
            .send()
            .await
            .map_err(|e| Error::Request { reason: e.to_string() })?;
        Ok(())
    }

    async fn release_tasks(&self, task_ids: Vec<u64>) -> Result<(), Error> {
        let url = format!("{}/api/tasks/release", self.base_url);
        let _ = self
            .client
            .post(url)
            .json(&ReleaseTasksRequest { task_ids })
            .send()
            .await
            .map_err(|e| Error::Request { reason: e.to_string() })?;
        Ok(())
    }
}
