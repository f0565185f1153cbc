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

//! The per-worker task pipeline (§4.F): feeder, worker pool, processing
//! loop, and batched result submitter, wired together the way the base
//! engine wires a receiver/processor/exporter chain together, generalized
//! here to a dynamically AIMD-sized pool instead of a static one.

pub mod coordinator_client;
pub mod feeder;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod submitter;

use std::sync::Arc;
use std::time::Duration;

use aimd::AimdController;
use metrics::MetricsWindow;
use model::wire::TaskResult;
use proxy::ProxySource;
use ratelimit::TokenBucket;
use session::Fetch;
use task::labels::TaskLabels;
use task::TaskManager;
use tokio_util::sync::CancellationToken;

use coordinator_client::CoordinatorClient;
use feeder::FeederConfig;
use parser::PageParser;
use pool::PoolContext;
use queue::LocalQueue;
use submitter::SubmitterConfig;

/// Aggregate tuning for one worker's pipeline, derived from
/// `model::RuntimeSettings` at startup and refreshed on each sync.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Feeder tuning.
    pub feeder: FeederConfig,
    /// Submitter tuning.
    pub submitter: SubmitterConfig,
    /// How often the AIMD controller re-evaluates concurrency (§4.E).
    pub adjust_interval: Duration,
    /// Retry ceiling before a task is terminally failed.
    pub max_retries: u32,
}

/// The running collaborators of one worker's pipeline. Dropping this
/// does not stop the spawned coroutines; they're owned by the
/// `TaskManager` they were registered with.
pub struct Pipeline {
    /// Local claimed-task buffer, exposed so the worker binary's
    /// settings-sync loop can inspect its fill level if needed.
    pub queue: Arc<LocalQueue>,
}

/// Spawns the feeder, pool supervisor, result submitter, and AIMD
/// evaluation ticker, registering each with `task_manager` so the
/// worker binary can join them all on shutdown.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    worker_id: String,
    client: Arc<dyn CoordinatorClient>,
    controller: Arc<AimdController>,
    metrics: Arc<MetricsWindow>,
    rate_limiter: Arc<TokenBucket>,
    proxy: Arc<dyn ProxySource>,
    session: Arc<dyn Fetch>,
    parser: Arc<dyn PageParser>,
    config: PipelineConfig,
    task_manager: &mut TaskManager,
    cancel: CancellationToken,
) -> Pipeline {
    let queue = Arc::new(LocalQueue::new(config.feeder.queue_capacity));
    let (results_tx, results_rx) = flume::unbounded::<TaskResult>();

    let process_labels = task_manager.process_labels();

    {
        let feeder_worker_id = worker_id.clone();
        let client = client.clone();
        let controller = controller.clone();
        let queue = queue.clone();
        let feeder_config = config.feeder;
        let labels = TaskLabels::new("pipeline", "feeder", &worker_id);
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            feeder::run(feeder_worker_id, client, controller, queue, feeder_config, cancel).await;
            TaskManager::no_task_cleaner(process_labels.clone(), labels.clone())
        });
        task_manager.register(handle, &TaskLabels::new("pipeline", "feeder", &worker_id));
    }

    {
        let ctx = Arc::new(PoolContext {
            worker_id: worker_id.clone(),
            queue: queue.clone(),
            controller: controller.clone(),
            metrics: metrics.clone(),
            rate_limiter,
            proxy,
            session,
            parser,
            results_tx,
            max_retries: config.max_retries,
        });
        let process_labels = task_manager.process_labels();
        let labels = TaskLabels::new("pipeline", "pool", &worker_id);
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            pool::run_supervisor(ctx, cancel).await;
            TaskManager::no_task_cleaner(process_labels, labels)
        });
        task_manager.register(handle, &TaskLabels::new("pipeline", "pool", &worker_id));
    }

    {
        let submitter_config = config.submitter;
        let process_labels = task_manager.process_labels();
        let labels = TaskLabels::new("pipeline", "submitter", &worker_id);
        let handle = tokio::spawn(async move {
            // No cancellation check here: the submitter's own shutdown
            // signal is the result channel closing, which happens once
            // the pool supervisor above has drained every slot and
            // dropped its last `results_tx` clone (§5 item iv: "flushing
            // the result queue" happens after the pool has stopped, not
            // concurrently with it being told to).
            submitter::run(client, results_rx, submitter_config).await;
            TaskManager::no_task_cleaner(process_labels, labels)
        });
        task_manager.register(handle, &TaskLabels::new("pipeline", "submitter", &worker_id));
    }

    {
        let adjust_interval = config.adjust_interval;
        let _ = task_manager.process_labels();
        let cancel = cancel.clone();
        let handle: tokio::task::JoinHandle<Box<dyn task::TaskCleaner>> = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(adjust_interval) => {}
                }
                let decision = controller.evaluate().await;
                tracing::debug!(?decision, "aimd ticker: evaluated");
            }
        });
        task_manager.register(handle, &TaskLabels::new("pipeline", "aimd_ticker", &worker_id));
    }

    Pipeline { queue }
}
