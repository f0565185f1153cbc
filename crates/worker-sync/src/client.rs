//! The worker's view of the coordinator's sync endpoint (§6, §4.H),
//! kept separate from `pipeline::coordinator_client::CoordinatorClient`
//! since the sync exchange carries settings/quota/block state rather
//! than tasks.

use async_trait::async_trait;
use model::wire::{SyncRequest, SyncResponse};
use model::MetricsSnapshot;

/// Errors talking to the coordinator's sync endpoint.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The HTTP request itself failed (connect, timeout, decode).
    #[error("sync request failed: {reason}")]
    Request {
        /// Human-readable failure detail.
        reason: String,
    },
}

/// The coordinator's sync-facing surface.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Posts this worker's id and (if available) its latest metrics
    /// snapshot, returning the coordinator's authoritative settings,
    /// quota, and block-state view.
    async fn sync(&self, worker_id: &str, metrics: Option<MetricsSnapshot>) -> Result<SyncResponse, Error>;
}

/// `reqwest`-backed [`SyncClient`], with a hard per-call timeout (§5
/// "every outbound HTTP call has a hard timeout, default 15s").
pub struct HttpSyncClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSyncClient {
    /// Creates a client talking to `base_url` (no trailing slash).
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn sync(&self, worker_id: &str, metrics: Option<MetricsSnapshot>) -> Result<SyncResponse, Error> {
        let url = format!("{}/api/worker/sync", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&SyncRequest { worker_id: worker_id.to_string(), metrics })
            .send()
            .await
            .map_err(|e| Error::Request { reason: e.to_string() })?;
        response.json().await.map_err(|e| Error::Request { reason: e.to_string() })
    }
}
