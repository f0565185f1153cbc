//! The worker process entry point (§6, §4.H): bootstraps from the
//! coordinator's settings map, runs the task pipeline, and keeps its
//! local controllers in sync on a 30s cadence.

use std::sync::Arc;
use std::time::Duration;

use aimd::{AimdController, Thresholds};
use async_trait::async_trait;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use metrics::MetricsWindow;
use mimalloc_rust::GlobalMiMalloc;
use model::{ProxyMode, RuntimeSettings};
use pipeline::coordinator_client::HttpCoordinatorClient;
use pipeline::parser::PassthroughParser;
use pipeline::{feeder::FeederConfig, submitter::SubmitterConfig, PipelineConfig};
use proxy::{DynamicProxySource, ProxyManager, ProxySource, TpsProxyManager, TunnelProxyManager};
use ratelimit::TokenBucket;
use session::ReqwestSession;
use task::labels::ProcessLabels;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use worker_sync::{HttpSyncClient, ProxyManagerFactory, SyncClient, WorkerSyncState};

#[global_allocator]
static GLOBAL_MIMALLOC: GlobalMiMalloc = GlobalMiMalloc;

/// Fatal configuration error.
const EXIT_CONFIG_ERROR: i32 = 1;
/// The coordinator could not be reached at start-up (§6).
const EXIT_UPSTREAM_UNREACHABLE: i32 = 2;
/// Graceful shutdown after SIGINT/SIGTERM.
const EXIT_SHUTDOWN: i32 = 130;

/// Hard per-outbound-call timeout (§5).
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "worker", about = "Scraping fleet worker: task pipeline, proxy manager, AIMD controller")]
struct Args {
    /// This worker's stable id, attributed on every task claim and result.
    #[arg(long)]
    worker_id: String,

    /// Base URL of the coordinator's HTTP API, e.g. `http://coordinator:8080`.
    #[arg(long)]
    coordinator_url: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to build tokio runtime")?;

    let exit_code = runtime.block_on(run(args));
    std::process::exit(exit_code);
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default tracing subscriber failed");
}

async fn run(args: Args) -> i32 {
    let http_client = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
        Ok(client) => client,
        Err(error) => {
            error!(%error, "worker: failed to build HTTP client");
            return EXIT_CONFIG_ERROR;
        }
    };

    let sync_client: Arc<dyn SyncClient> = Arc::new(HttpSyncClient::new(http_client.clone(), args.coordinator_url.clone()));

    // §4.H bootstrap: fetch the full settings map before anything else,
    // so a worker needs only the coordinator URL to start.
    let settings = match sync_client.sync(&args.worker_id, None).await {
        Ok(response) => response.settings,
        Err(error) => {
            error!(%error, "worker: could not reach coordinator at start-up");
            return EXIT_UPSTREAM_UNREACHABLE;
        }
    };

    let process_labels = ProcessLabels::new("worker");
    let mut task_manager = task::TaskManager::with_process_labels(process_labels);

    // No per-worker bandwidth budget is modeled in `RuntimeSettings`; 0.0
    // disables rule #3's soft-cap hold (see `MetricsWindow::bandwidth_pct`).
    let metrics = Arc::new(MetricsWindow::new(0.0));

    let thresholds = Thresholds {
        block_threshold: settings.block_rate_threshold,
        min_success: settings.min_success_rate,
        max_latency_s: settings.max_latency_s,
        target_success: settings.target_success_rate,
        target_latency_s: settings.target_latency_s,
        cooldown_s: u64::from(settings.cooldown_after_block_s),
    };
    let controller = Arc::new(AimdController::new(
        settings.initial_concurrency,
        settings.min_concurrency,
        settings.max_concurrency,
        settings.proxy_mode,
        thresholds,
        metrics.clone(),
    ));

    let rate_limiter = Arc::new(TokenBucket::new(settings.token_bucket_rate));

    let factory: Arc<dyn ProxyManagerFactory> = Arc::new(HttpProxyManagerFactory { client: http_client.clone() });
    let initial_manager = factory.build(&settings).await;
    let is_tunnel = initial_manager.as_tunnel().is_some();
    let initial_stats = initial_manager.stats().await;
    if initial_stats.total_fetched == 0 && initial_stats.total_errors > 0 {
        error!("worker: could not reach upstream proxy API at start-up");
        return EXIT_UPSTREAM_UNREACHABLE;
    }
    let proxy_source = Arc::new(DynamicProxySource::new(initial_manager));

    let sync_state = Arc::new(WorkerSyncState::new(
        controller.clone(),
        rate_limiter.clone(),
        proxy_source.clone(),
        factory,
        settings.proxy_mode,
    ));

    let session = Arc::new(ReqwestSession::new(HTTP_TIMEOUT));
    let parser = Arc::new(PassthroughParser);
    let coordinator_client = Arc::new(HttpCoordinatorClient::new(http_client, args.coordinator_url.clone()));

    let pipeline_config = PipelineConfig {
        feeder: FeederConfig { queue_capacity: 100, prefetch_threshold: 0.5, poll_interval: Duration::from_secs(1) },
        submitter: SubmitterConfig { batch_size: 10, batch_interval: Duration::from_secs(2), max_batch_retries: 3 },
        adjust_interval: Duration::from_secs(u64::from(settings.adjust_interval_s)),
        max_retries: settings.max_retries,
    };

    let cancel = CancellationToken::new();

    let _pipeline = pipeline::spawn(
        args.worker_id.clone(),
        coordinator_client,
        controller,
        metrics.clone(),
        rate_limiter,
        proxy_source.clone(),
        session,
        parser,
        pipeline_config,
        &mut task_manager,
        cancel.clone(),
    );

    {
        let worker_id = args.worker_id.clone();
        let sync_client = sync_client.clone();
        let metrics = metrics.clone();
        let sync_state = sync_state.clone();
        let process_labels = task_manager.process_labels();
        let labels = task::labels::TaskLabels::new("worker", "sync", &worker_id);
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            worker_sync::run(worker_id, sync_client, metrics, sync_state, worker_sync::SYNC_INTERVAL, cancel).await;
            task::TaskManager::no_task_cleaner(process_labels, labels)
        });
        task_manager.register(handle, &task::labels::TaskLabels::new("worker", "sync", &args.worker_id));
    }

    if is_tunnel {
        let proxy_source = proxy_source.clone();
        let process_labels = task_manager.process_labels();
        let labels = task::labels::TaskLabels::new("worker", "tunnel_rotation", &args.worker_id);
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
                let manager = proxy_source.current().await;
                if let Some(tunnel) = manager.as_tunnel() {
                    if tunnel.handle_ip_rotation().await {
                        info!("worker: tunnel channels rotated");
                    }
                }
            }
            task::TaskManager::no_task_cleaner(process_labels, labels)
        });
        task_manager.register(handle, &task::labels::TaskLabels::new("worker", "tunnel_rotation", &args.worker_id));
    }

    wait_for_termination().await;
    info!("worker: termination signal received, shutting down");

    // §5's shutdown sequence: refuse new pulls (feeder observes `cancel`),
    // drain in-flight work with a bounded grace period (pool supervisor),
    // flush the result queue (submitter exits once the pool's last
    // `results_tx` clone drops), then let every registered coroutine join.
    cancel.cancel();
    let grace = tokio::time::timeout(Duration::from_secs(25), task_manager.join());
    if grace.await.is_err() {
        warn!("worker: shutdown grace period elapsed before all tasks joined, exiting anyway");
    }
    EXIT_SHUTDOWN
}

/// Builds a [`ProxyManager`] from `RuntimeSettings`, grounding the choice
/// of concrete type in `settings.proxy_mode` the way §4.H step 1
/// describes a mode switch reinitialising the manager.
struct HttpProxyManagerFactory {
    client: reqwest::Client,
}

#[async_trait]
impl ProxyManagerFactory for HttpProxyManagerFactory {
    async fn build(&self, settings: &RuntimeSettings) -> ProxyManager {
        match settings.proxy_mode {
            ProxyMode::Tps => ProxyManager::Tps(TpsProxyManager::new(
                self.client.clone(),
                settings.proxy_api_url.clone(),
                Duration::from_secs(30),
            )),
            ProxyMode::Tunnel => {
                let manager = TunnelProxyManager::new(
                    self.client.clone(),
                    settings.proxy_api_url.clone(),
                    settings.tunnel_channel_count,
                    Duration::from_secs(settings.tunnel_rotation_interval_s),
                );
                if let Err(error) = manager.init_channels().await {
                    warn!(%error, "worker: tunnel channel (re)init failed, keeping stale/empty channels");
                }
                ProxyManager::Tunnel(manager)
            }
        }
    }
}

/// Waits for either SIGINT or SIGTERM (Unix) / Ctrl-C (other platforms).
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
