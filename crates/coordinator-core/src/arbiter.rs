//! The coordinator's single state-holder (§9: "a single 'state-holder'
//! value guarded by a mutex"), processing sync RPCs, settings writes,
//! and the periodic sweep as serialised operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use model::wire::{CoordinatorStatus, SyncResponse, TaskResult};
use model::{GlobalBlockDescriptor, GlobalBlockState, MetricsSnapshot, Quota, RuntimeSettings, SettingsError, Task};
use tokio::sync::Mutex;
use tracing::info;

use crate::quota::{self, WorkerMetricsEntry};
use crate::registry::WorkerRegistry;
use crate::settings::SettingsStore;
use crate::tasks::TaskStore;
use crate::{block, unix_now};

/// How often the background sweep runs (§4.G "Task sweep").
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default `processing` timeout before a task is swept back to pending.
pub const DEFAULT_TASK_TIMEOUT_S: u64 = 300;

struct State {
    registry: WorkerRegistry,
    metrics: HashMap<String, WorkerMetricsEntry>,
    quotas: HashMap<String, Quota>,
    block: GlobalBlockState,
    jitter: HashMap<String, f64>,
    settings: SettingsStore,
}

/// The coordinator's full in-memory arbiter: worker registry, per-worker
/// quotas, the global block FSM, and settings versioning, all behind one
/// mutex, plus the (separately locked) task backlog.
pub struct Arbiter {
    state: Mutex<State>,
    tasks: Arc<dyn TaskStore>,
    task_timeout_s: u64,
}

impl Arbiter {
    /// Creates an arbiter seeded with `settings` and backed by `tasks`.
    #[must_use]
    pub fn new(settings: RuntimeSettings, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            state: Mutex::new(State {
                registry: WorkerRegistry::new(),
                metrics: HashMap::new(),
                quotas: HashMap::new(),
                block: GlobalBlockState::default(),
                jitter: HashMap::new(),
                settings: SettingsStore::new(settings),
            }),
            tasks,
            task_timeout_s: DEFAULT_TASK_TIMEOUT_S,
        }
    }

    /// `GET /api/tasks/pull`.
    pub async fn pull_tasks(&self, worker_id: &str, count: u32) -> Vec<Task> {
        self.tasks.pull(worker_id, count, unix_now()).await
    }

    /// `POST /api/tasks/result/batch`.
    pub async fn submit_results(&self, results: Vec<TaskResult>) {
        let now = unix_now();
        let max_retries = {
            let mut state = self.state.lock().await;
            for result in &results {
                state.registry.record_counters(&result.worker_id, u64::from(result.success), u64::from(!result.success), 0);
            }
            state.settings.current().max_retries
        };
        self.tasks.submit_results(results, max_retries, now).await;
    }

    /// `POST /api/tasks/release`.
    pub async fn release_tasks(&self, task_ids: Vec<u64>) {
        self.tasks.release(&task_ids, unix_now()).await;
    }

    /// `POST /api/worker/sync`: the coordinator's one stateful RPC.
    /// Touches the registry, folds in a fresh metrics report (possibly
    /// triggering the global block FSM), reallocates quotas, and returns
    /// this worker's authoritative view.
    pub async fn sync(&self, worker_id: String, metrics: Option<MetricsSnapshot>) -> SyncResponse {
        let now = unix_now();
        let mut state = self.state.lock().await;
        state.registry.touch(&worker_id, now);

        if let Some(snapshot) = metrics {
            let settings = state.settings.current();
            let active = state.registry.active_ids(now);
            if let Some((new_block, new_jitter)) = block::maybe_trigger(
                &state.block,
                snapshot.block_rate,
                settings.block_rate_threshold,
                u64::from(settings.cooldown_after_block_s),
                &worker_id,
                &active,
                now,
                &mut rand::thread_rng(),
            ) {
                info!(%worker_id, epoch = new_block.recovery_epoch, "coordinator: global block triggered");
                state.block = new_block;
                state.jitter = new_jitter;
            }
            let _ = state.metrics.insert(worker_id.clone(), WorkerMetricsEntry { snapshot, reported_at: now });
        }

        reallocate_locked(&mut state, now);

        let settings = state.settings.current();
        let quota = state.quotas.get(&worker_id).copied().unwrap_or(Quota {
            concurrency: settings.initial_concurrency,
            qps: settings.token_bucket_rate,
            assigned_at: now,
        });
        let block_active = state.block.is_active(now);
        let recovery_jitter = state.jitter.get(&worker_id).copied().unwrap_or(0.5);
        let block_state = state.block;

        SyncResponse {
            settings,
            quota,
            block: GlobalBlockDescriptor {
                active: block_active,
                remaining_s: block_state.block_until.saturating_sub(now),
                triggered_by: block_state.triggered_by,
                epoch: block_state.recovery_epoch,
                recovery_jitter,
            },
        }
    }

    /// `GET /api/settings`.
    pub async fn get_settings(&self) -> RuntimeSettings {
        self.state.lock().await.settings.current()
    }

    /// `PUT /api/settings`. Returns the applied settings on success, the
    /// validation failure (unapplied) otherwise.
    pub async fn put_settings(&self, candidate: RuntimeSettings) -> Result<RuntimeSettings, SettingsError> {
        self.state.lock().await.settings.update(candidate)
    }

    /// `GET /api/coordinator`.
    pub async fn status(&self) -> CoordinatorStatus {
        let now = unix_now();
        let (pending, processing) = self.tasks.counts().await;
        let state = self.state.lock().await;
        CoordinatorStatus {
            pending_tasks: pending,
            processing_tasks: processing,
            active_workers: state.registry.active_ids(now),
            settings_version: state.settings.current().version,
            block_active: state.block.is_active(now),
            block_epoch: state.block.recovery_epoch,
        }
    }

    /// Runs the periodic sweep (§4.G "Task sweep") until `cancel` fires:
    /// reclaims stale `processing` tasks, reallocates quotas, and evicts
    /// workers unseen for more than the eviction threshold.
    pub async fn run_sweep_loop(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
            let now = unix_now();
            let swept = self.tasks.sweep(self.task_timeout_s, now).await;
            if swept > 0 {
                info!(swept, "coordinator: swept stale processing tasks back to pending");
            }
            let mut state = self.state.lock().await;
            let evicted = state.registry.evict_stale(now);
            for worker_id in &evicted {
                let _ = state.metrics.remove(worker_id);
                let _ = state.quotas.remove(worker_id);
                let _ = state.jitter.remove(worker_id);
            }
            if !evicted.is_empty() {
                info!(count = evicted.len(), "coordinator: evicted inactive workers");
            }
            reallocate_locked(&mut state, now);
        }
    }
}

fn reallocate_locked(state: &mut State, now: u64) {
    let active = state.registry.active_ids(now);
    let settings = state.settings.current();
    state.quotas = quota::allocate_quotas(&active, &state.metrics, &settings, &state.block, &state.jitter, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::InMemoryTaskStore;

    fn healthy(success: f64, block: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            count: 50,
            success_rate: success,
            block_rate: block,
            p50_latency_s: 1.0,
            p95_latency_s: 1.5,
            bytes_per_sec: 0.0,
            bandwidth_pct: 0.0,
            in_flight: 0,
            window_span_s: 10.0,
        }
    }

    #[tokio::test]
    async fn first_sync_gets_initial_concurrency_as_quota() {
        let arbiter = Arbiter::new(RuntimeSettings::default(), Arc::new(InMemoryTaskStore::new()));
        let response = arbiter.sync("w1".to_string(), None).await;
        assert!(response.quota.concurrency > 0);
        assert!(!response.block.active);
    }

    #[tokio::test]
    async fn block_storm_triggers_exactly_once_and_halves_budget() {
        let arbiter = Arbiter::new(RuntimeSettings::default(), Arc::new(InMemoryTaskStore::new()));
        let _ = arbiter.sync("w1".to_string(), Some(healthy(0.9, 0.0))).await;
        let first = arbiter.sync("w1".to_string(), Some(healthy(0.9, 0.10))).await;
        assert!(first.block.active);
        assert_eq!(first.block.epoch, 1);
        assert!(first.block.recovery_jitter >= 0.0 && first.block.recovery_jitter <= 1.0);

        let second = arbiter.sync("w1".to_string(), Some(healthy(0.9, 0.10))).await;
        assert_eq!(second.block.epoch, 1, "epoch must not increment twice for one cooldown");
    }

    #[tokio::test]
    async fn asymmetric_health_yields_more_concurrency_for_healthier_worker() {
        let arbiter = Arbiter::new(RuntimeSettings::default(), Arc::new(InMemoryTaskStore::new()));
        let a = arbiter.sync("a".to_string(), Some(healthy(0.95, 0.0))).await;
        let b = arbiter.sync("b".to_string(), Some(healthy(0.60, 0.10))).await;
        // Reallocation happens on each sync using the latest snapshot of
        // both workers, so resync once more to see the settled split.
        let a = arbiter.sync("a".to_string(), Some(healthy(0.95, 0.0))).await;
        let b2 = arbiter.sync("b".to_string(), Some(healthy(0.60, 0.10))).await;
        let _ = b;
        assert!(a.quota.concurrency >= b2.quota.concurrency);
        assert!(a.quota.concurrency + b2.quota.concurrency <= RuntimeSettings::default().global_max_concurrency);
    }

    #[tokio::test]
    async fn settings_rollback_does_not_affect_quota_flow() {
        let arbiter = Arbiter::new(RuntimeSettings::default(), Arc::new(InMemoryTaskStore::new()));
        let before = arbiter.get_settings().await;
        let mut bad = before.clone();
        bad.target_latency_s = 50.0;
        bad.max_latency_s = 2.0;
        assert!(arbiter.put_settings(bad).await.is_err());
        let after = arbiter.get_settings().await;
        assert_eq!(after.version, before.version);
    }
}
