#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The worker↔coordinator sync exchange (§4.H): every interval, post
//! the latest metrics snapshot and apply the returned settings, quota,
//! and block-state deltas in order.

pub mod apply;
pub mod client;
pub mod factory;

use std::sync::Arc;
use std::time::Duration;

use metrics::MetricsWindow;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use apply::WorkerSyncState;
pub use client::{Error, HttpSyncClient, SyncClient};
pub use factory::ProxyManagerFactory;

/// Default sync cadence (§4.H: "every 30s").
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Performs the bootstrap sync (§4.H: "fetches the full settings map ...
/// so a worker needs only the coordinator URL to bootstrap"), with no
/// metrics attached, and applies the result.
pub async fn initial_sync(worker_id: &str, client: &dyn SyncClient, state: &WorkerSyncState) -> Result<(), Error> {
    let response = client.sync(worker_id, None).await?;
    let _ = state.apply(&response).await;
    Ok(())
}

/// Runs the periodic sync loop until `cancel` fires, logging (without
/// panicking) on transport failure so one dropped sync doesn't take the
/// worker down.
pub async fn run(worker_id: String, client: Arc<dyn SyncClient>, metrics: Arc<MetricsWindow>, state: Arc<WorkerSyncState>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        let snapshot = metrics.snapshot();
        match client.sync(&worker_id, Some(snapshot)).await {
            Ok(response) => {
                let _ = state.apply(&response).await;
            }
            Err(error) => {
                warn!(%error, "worker-sync: sync round failed, retaining previous settings/quota");
            }
        }
    }
}
