//! The worker pool supervisor and per-task processing loop (§4.F items 2
//! and 3).
//!
//! The supervisor keeps exactly `C` processing loops alive, `C` being the
//! AIMD controller's current concurrency target; reconciliation (rather
//! than a semaphore permit per task) is what turns AIMD's decisions into
//! actual parallelism here, mirroring how the base engine's controllers
//! track one join handle per running pipeline and reconcile against a
//! desired topology.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aimd::AimdController;
use metrics::MetricsWindow;
use model::{RequestOutcome, Task, TaskState};
use proxy::ProxySource;
use ratelimit::TokenBucket;
use serde_json::json;
use session::{Fetch, FetchError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parser::{PageParser, ParsedKind};
use crate::queue::LocalQueue;
use model::wire::TaskResult;

/// Shared, immutable collaborators every processing loop needs. Cloned
/// (cheaply, via `Arc`) into each spawned slot.
pub struct PoolContext {
    /// This worker's stable id, attributed on results and proxy reports.
    pub worker_id: String,
    /// Local claimed-task buffer.
    pub queue: Arc<LocalQueue>,
    /// The AIMD controller sizing this pool and gating health decisions.
    pub controller: Arc<AimdController>,
    /// Rolling request metrics, fed by every processed task.
    pub metrics: Arc<MetricsWindow>,
    /// Per-worker QPS limiter.
    pub rate_limiter: Arc<TokenBucket>,
    /// Proxy source, TPS or tunnel.
    pub proxy: Arc<dyn ProxySource>,
    /// HTTP fetch collaborator.
    pub session: Arc<dyn Fetch>,
    /// Page parser.
    pub parser: Arc<dyn PageParser>,
    /// Completed results, drained by the submitter.
    pub results_tx: flume::Sender<TaskResult>,
    /// Ceiling on `Task::retry_count` before a task is terminally failed.
    pub max_retries: u32,
}

/// How often the supervisor reconciles slot count against `C`, and how
/// far apart newly spawned slots are staggered.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);
const SPAWN_STAGGER: Duration = Duration::from_millis(50);
/// Per-iteration dequeue timeout (§4.F item 3), so a slot told to stop
/// notices within one tick instead of blocking on an empty queue forever.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff before requeuing a timed-out or network-failed fetch (§7).
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
/// Bounded grace period the supervisor waits for in-flight slots to
/// drain after cancellation before giving up on them (§5 item iii).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

struct Slot {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Runs until `cancel` fires, keeping the live slot count equal to
/// `ctx.controller.current_concurrency()` until then. On cancellation,
/// every slot is signalled to stop and the supervisor waits up to
/// `SHUTDOWN_GRACE` for them to drain in-flight work (§5 items ii-iii)
/// before returning; returning drops this function's `Arc<PoolContext>`
/// clone, and once every slot has also exited, the last reference to
/// `results_tx` goes with it, letting the submitter see a closed channel
/// and flush its buffer.
pub async fn run_supervisor(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    let mut slots: Vec<Slot> = Vec::new();

    loop {
        slots.retain(|slot| !slot.handle.is_finished());

        if cancel.is_cancelled() {
            break;
        }

        let desired = ctx.controller.current_concurrency().await as usize;
        let actual = slots.len();

        if desired > actual {
            for i in 0..(desired - actual) {
                if i > 0 {
                    tokio::time::sleep(SPAWN_STAGGER).await;
                }
                let stop = Arc::new(AtomicBool::new(false));
                let handle = tokio::spawn(run_slot(ctx.clone(), stop.clone(), cancel.clone()));
                slots.push(Slot { stop, handle });
            }
            debug!(desired, actual, "pool: grew to match concurrency target");
        } else if desired < actual {
            for slot in slots.iter().rev().take(actual - desired) {
                slot.stop.store(true, Ordering::Relaxed);
            }
            debug!(desired, actual, "pool: signalled excess slots to stop");
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(RECONCILE_INTERVAL) => {}
        }
    }

    debug!(slots = slots.len(), "pool: cancelled, signalling all slots and draining");
    for slot in &slots {
        slot.stop.store(true, Ordering::Relaxed);
    }
    let drain = async {
        for slot in slots {
            let _ = slot.handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("pool: shutdown grace period elapsed with slots still draining, abandoning them");
    }
}

async fn run_slot(ctx: Arc<PoolContext>, stop: Arc<AtomicBool>, cancel: CancellationToken) {
    while !stop.load(Ordering::Relaxed) && !cancel.is_cancelled() {
        let _permit = ctx.controller.acquire().await;
        if let Some(task) = ctx.queue.pop_timeout(DEQUEUE_TIMEOUT).await {
            process_one(&ctx, task).await;
        }
    }
}

enum Classification {
    Success,
    NotFound,
    Blocked,
    Captcha,
    Timeout,
    Network,
    ParseError,
}

impl Classification {
    fn error_type(&self) -> Option<&'static str> {
        match self {
            Classification::Success | Classification::NotFound => None,
            Classification::Blocked => Some("blocked"),
            Classification::Captcha => Some("captcha"),
            Classification::Timeout => Some("timeout"),
            Classification::Network => Some("network"),
            Classification::ParseError => Some("parse_error"),
        }
    }

    fn is_blocked_signal(&self) -> bool {
        matches!(self, Classification::Blocked | Classification::Captcha)
    }
}

async fn process_one(ctx: &Arc<PoolContext>, mut task: Task) {
    let url = match task.params.get("url").and_then(|v| v.as_str()) {
        Some(url) => url.to_string(),
        None => {
            warn!(task_id = task.id, "pool: task has no url param, failing terminally");
            emit_terminal(ctx, &task, Classification::ParseError, "missing `url` parameter").await;
            return;
        }
    };

    ctx.rate_limiter.acquire().await;

    let (proxy_url, channel) = match ctx.proxy.get_proxy(None).await {
        Ok(pair) => pair,
        Err(error) => {
            retry_or_fail(ctx, task, Classification::Network, &error.to_string()).await;
            return;
        }
    };

    ctx.metrics.request_start();
    let started = Instant::now();
    let fetch_result = ctx.session.fetch(&url, &proxy_url, &[]).await;
    let elapsed = started.elapsed().as_secs_f64();

    let (classification, bytes, detail) = match fetch_result {
        Err(FetchError::Timeout { timeout_s }) => (Classification::Timeout, 0, format!("timed out after {timeout_s}s")),
        Err(FetchError::Transport { reason }) => (Classification::Network, 0, reason),
        Ok(outcome) if outcome.blocked => (Classification::Blocked, outcome.bytes, "anti-bot response detected".into()),
        Ok(outcome) if outcome.not_found => (Classification::NotFound, outcome.bytes, String::new()),
        Ok(outcome) => {
            let parsed = ctx.parser.parse(&outcome.body).await;
            match parsed.kind {
                ParsedKind::Ok if parsed.sanity_ok => (Classification::Success, outcome.bytes, String::new()),
                ParsedKind::Ok => (Classification::ParseError, outcome.bytes, "sanity check failed".into()),
                ParsedKind::Captcha => (Classification::Captcha, outcome.bytes, "captcha page".into()),
                ParsedKind::ApiBlock => (Classification::Blocked, outcome.bytes, "api block marker".into()),
                ParsedKind::Empty => (Classification::ParseError, outcome.bytes, "empty body".into()),
                ParsedKind::ParseError => (Classification::ParseError, outcome.bytes, "unparsable body".into()),
                ParsedKind::TitleMissing => (Classification::ParseError, outcome.bytes, "title field missing".into()),
            }
        }
    };

    ctx.metrics.request_end();
    ctx.metrics.record(RequestOutcome {
        at: 0.0,
        latency_s: elapsed,
        success: matches!(classification, Classification::Success | Classification::NotFound),
        blocked: classification.is_blocked_signal(),
        bytes,
    });

    if classification.is_blocked_signal() {
        if let Err(error) = ctx.proxy.report_blocked(channel).await {
            warn!(%error, "pool: report_blocked failed");
        }
        let _ = ctx.session.rotate().await;
    }

    match classification {
        Classification::Success | Classification::NotFound => {
            let result = if matches!(classification, Classification::NotFound) {
                Some(json!({"not_found": true}))
            } else {
                Some(json!({}))
            };
            let _ = ctx.results_tx.send(TaskResult {
                task_id: task.id,
                worker_id: ctx.worker_id.clone(),
                success: true,
                result,
                error_type: None,
                error_detail: None,
            });
        }
        other => {
            task.retry_count += 1;
            retry_or_fail(ctx, task, other, &detail).await;
        }
    }
}

async fn retry_or_fail(ctx: &Arc<PoolContext>, mut task: Task, classification: Classification, detail: &str) {
    if task.retries_exhausted(ctx.max_retries) {
        emit_terminal(ctx, &task, classification, detail).await;
        return;
    }
    if matches!(classification, Classification::Timeout | Classification::Network) {
        tokio::time::sleep(RETRY_BACKOFF).await;
    }
    task.state = TaskState::Processing;
    ctx.queue.push_front_retry(task).await;
}

async fn emit_terminal(ctx: &Arc<PoolContext>, task: &Task, classification: Classification, detail: &str) {
    let _ = ctx.results_tx.send(TaskResult {
        task_id: task.id,
        worker_id: ctx.worker_id.clone(),
        success: false,
        result: None,
        error_type: Some(classification.error_type().unwrap_or("parse_error").to_string()),
        error_detail: Some(detail.to_string()),
    });
}
