//! Keeps the local queue topped up from the coordinator (§4.F item 1).
//!
//! Grounded on `examples/original_source/worker.py`'s prefetch loop,
//! generalized from a fixed batch size to one that tracks the AIMD
//! controller's current concurrency.

use std::sync::Arc;
use std::time::Duration;

use aimd::AimdController;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator_client::CoordinatorClient;
use crate::queue::LocalQueue;

/// Feeder tuning, derived from `model::RuntimeSettings` at startup.
#[derive(Debug, Clone, Copy)]
pub struct FeederConfig {
    /// Local queue capacity.
    pub queue_capacity: usize,
    /// Fraction of `queue_capacity` below which a pull is triggered.
    pub prefetch_threshold: f64,
    /// How often the fill level is checked.
    pub poll_interval: Duration,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            prefetch_threshold: 0.5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Ceiling on the empty-response backoff (§4.F item 1).
const MAX_EMPTY_BACKOFF: Duration = Duration::from_secs(30);

/// Runs until `cancel` fires (§5: "refusing new task pulls" is the
/// worker's first shutdown step). Pulls a fresh batch whenever the local
/// queue falls below `prefetch_threshold * queue_capacity`, sized to
/// `max(5, 2*C)` tasks. An empty response backs off exponentially
/// (starting at `poll_interval`, doubling up to `MAX_EMPTY_BACKOFF`)
/// before the next prefetch check is even attempted, so an idle
/// coordinator isn't hammered with pulls.
pub async fn run(
    worker_id: String,
    client: Arc<dyn CoordinatorClient>,
    controller: Arc<AimdController>,
    queue: Arc<LocalQueue>,
    config: FeederConfig,
    cancel: CancellationToken,
) {
    let low_water = (config.queue_capacity as f64 * config.prefetch_threshold) as usize;
    let mut empty_backoff = config.poll_interval;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("feeder: cancelled, no longer pulling new tasks");
                return;
            }
            () = tokio::time::sleep(config.poll_interval.max(empty_backoff)) => {}
        }

        let current_len = queue.len().await;
        if current_len > low_water {
            empty_backoff = config.poll_interval;
            continue;
        }

        let c = controller.current_concurrency().await;
        let pull_count = (2 * c).max(5);

        match client.pull_tasks(&worker_id, pull_count).await {
            Ok(tasks) if tasks.is_empty() => {
                debug!(backoff_s = empty_backoff.as_secs_f64(), "feeder: coordinator has no pending tasks, backing off");
                empty_backoff = (empty_backoff * 2).min(MAX_EMPTY_BACKOFF);
            }
            Ok(tasks) => {
                empty_backoff = config.poll_interval;
                let pulled = tasks.len();
                let evicted = queue.push_many_preempting(tasks).await;
                if !evicted.is_empty() {
                    warn!(count = evicted.len(), "feeder: releasing preempted/overflowed tasks back to coordinator");
                    let client = client.clone();
                    tokio::spawn(async move {
                        if let Err(error) = client.release_tasks(evicted).await {
                            warn!(%error, "feeder: failed to release preempted/overflowed tasks back to coordinator");
                        }
                    });
                }
                debug!(pulled, "feeder: topped up local queue");
            }
            Err(error) => {
                warn!(%error, "feeder: pull_tasks failed, will retry next tick");
            }
        }
    }
}
