//! Batches completed results back to the coordinator (§4.F item 4).
//!
//! Flushes on whichever comes first: `batch_size` accumulated results or
//! `batch_interval` elapsed. A batch that fails submission is retried
//! with exponential backoff up to three times before falling back to
//! submitting each result individually, so one malformed result in a
//! batch can't sink its siblings.

use std::sync::Arc;
use std::time::Duration;

use model::wire::TaskResult;
use tracing::warn;

use crate::coordinator_client::CoordinatorClient;

/// Submitter tuning.
#[derive(Debug, Clone, Copy)]
pub struct SubmitterConfig {
    /// Flush once this many results have accumulated.
    pub batch_size: usize,
    /// Flush at least this often, regardless of batch fill.
    pub batch_interval: Duration,
    /// Batch-level retry ceiling before falling back to per-item submission.
    pub max_batch_retries: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval: Duration::from_secs(2),
            max_batch_retries: 3,
        }
    }
}

/// Drains `results_rx` until the channel is closed, batching and
/// submitting along the way.
pub async fn run(client: Arc<dyn CoordinatorClient>, results_rx: flume::Receiver<TaskResult>, config: SubmitterConfig) {
    let mut buffer: Vec<TaskResult> = Vec::with_capacity(config.batch_size);
    loop {
        let deadline = tokio::time::sleep(config.batch_interval);
        tokio::pin!(deadline);

        tokio::select! {
            received = results_rx.recv_async() => {
                match received {
                    Ok(result) => {
                        buffer.push(result);
                        if buffer.len() >= config.batch_size {
                            flush(&client, &mut buffer, &config).await;
                        }
                    }
                    Err(_) => {
                        // Channel closed: flush whatever remains and stop.
                        if !buffer.is_empty() {
                            flush(&client, &mut buffer, &config).await;
                        }
                        return;
                    }
                }
            }
            () = &mut deadline => {
                if !buffer.is_empty() {
                    flush(&client, &mut buffer, &config).await;
                }
            }
        }
    }
}

async fn flush(client: &Arc<dyn CoordinatorClient>, buffer: &mut Vec<TaskResult>, config: &SubmitterConfig) {
    let batch = std::mem::take(buffer);
    let mut attempt = 0;
    let mut backoff = Duration::from_millis(250);

    loop {
        match client.submit_results(batch.clone()).await {
            Ok(()) => return,
            Err(error) => {
                attempt += 1;
                if attempt > config.max_batch_retries {
                    warn!(%error, batch_len = batch.len(), "submitter: batch submission exhausted retries, falling back to per-item");
                    submit_individually(client, batch).await;
                    return;
                }
                warn!(%error, attempt, "submitter: batch submission failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

async fn submit_individually(client: &Arc<dyn CoordinatorClient>, batch: Vec<TaskResult>) {
    for result in batch {
        let task_id = result.task_id;
        if let Err(error) = client.submit_results(vec![result]).await {
            warn!(%error, task_id, "submitter: per-item fallback submission also failed, result dropped");
        }
    }
}
