//! The coordinator's task backlog (§3 `Task`, §4.G sweep, §6 task
//! endpoints).
//!
//! §6 treats the backlog's persistence as external ("a relational store
//! for tasks and results ... the core assumes these are transactional
//! per call"). This in-memory store stands in for that external store
//! behind the same `TaskStore` trait boundary, under one mutex playing
//! the role of the spec's `IMMEDIATE`-equivalent write lock (§5: "task
//! pulls execute under a write lock so two concurrent pulls never return
//! overlapping ids").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use model::wire::TaskResult;
use model::{Task, TaskState};

/// The coordinator-facing task backlog operations the HTTP API depends
/// on.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically claims up to `count` pending tasks for `worker_id`,
    /// highest priority first (§8 invariant 7: exclusive claims even
    /// under concurrent calls).
    async fn pull(&self, worker_id: &str, count: u32, now: u64) -> Vec<Task>;

    /// Applies a batch of results. Successes terminate the task; a
    /// failure increments `retry_count` and either returns the task to
    /// `pending` or, once the ceiling is hit, terminally fails it.
    /// Unknown task ids and results for an already-`Done` task are
    /// ignored (idempotent on task id, §5 ordering guarantee (a)).
    async fn submit_results(&self, results: Vec<TaskResult>, max_retries: u32, now: u64);

    /// Resets the given ids to `pending`, regardless of current state.
    async fn release(&self, task_ids: &[u64], now: u64);

    /// Sweeps `processing` tasks whose `updated_at` is older than
    /// `timeout_s` back to `pending`. Returns the number swept.
    async fn sweep(&self, timeout_s: u64, now: u64) -> usize;

    /// `(pending, processing)` counts, for the observability endpoint.
    async fn counts(&self) -> (u64, u64);

    /// Enqueues new tasks (not part of the spec's external HTTP surface,
    /// but the only way work enters the backlog; exercised directly by
    /// tests and by whatever out-of-scope ingestion job feeds the
    /// catalog in a real deployment).
    async fn enqueue(&self, batch: String, item_id: String, params: serde_json::Value, priority: i32, now: u64) -> u64;
}

struct Inner {
    tasks: HashMap<u64, Task>,
    next_id: u64,
}

/// The default, in-process [`TaskStore`].
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { tasks: HashMap::new(), next_id: 1 }) }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn pull(&self, worker_id: &str, count: u32, now: u64) -> Vec<Task> {
        let mut inner = self.inner.lock().expect("task store mutex poisoned");
        let mut candidate_ids: Vec<u64> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.id)
            .collect();
        candidate_ids.sort_by_key(|&id| {
            let t = &inner.tasks[&id];
            (std::cmp::Reverse(t.priority), id)
        });
        candidate_ids.truncate(count as usize);

        let mut claimed = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Processing;
                task.owner = Some(worker_id.to_string());
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        claimed
    }

    async fn submit_results(&self, results: Vec<TaskResult>, max_retries: u32, now: u64) {
        let mut inner = self.inner.lock().expect("task store mutex poisoned");
        for result in results {
            let Some(task) = inner.tasks.get_mut(&result.task_id) else { continue };
            if task.state == TaskState::Done {
                continue;
            }
            if result.success {
                task.state = TaskState::Done;
            } else {
                task.retry_count += 1;
                task.state = if task.retries_exhausted(max_retries) { TaskState::Failed } else { TaskState::Pending };
            }
            task.owner = None;
            task.updated_at = now;
        }
    }

    async fn release(&self, task_ids: &[u64], now: u64) {
        let mut inner = self.inner.lock().expect("task store mutex poisoned");
        for id in task_ids {
            if let Some(task) = inner.tasks.get_mut(id) {
                task.state = TaskState::Pending;
                task.owner = None;
                task.updated_at = now;
            }
        }
    }

    async fn sweep(&self, timeout_s: u64, now: u64) -> usize {
        let mut inner = self.inner.lock().expect("task store mutex poisoned");
        let mut swept = 0;
        for task in inner.tasks.values_mut() {
            if task.state == TaskState::Processing && now.saturating_sub(task.updated_at) > timeout_s {
                task.state = TaskState::Pending;
                task.owner = None;
                task.updated_at = now;
                swept += 1;
            }
        }
        swept
    }

    async fn counts(&self) -> (u64, u64) {
        let inner = self.inner.lock().expect("task store mutex poisoned");
        let pending = inner.tasks.values().filter(|t| t.state == TaskState::Pending).count() as u64;
        let processing = inner.tasks.values().filter(|t| t.state == TaskState::Processing).count() as u64;
        (pending, processing)
    }

    async fn enqueue(&self, batch: String, item_id: String, params: serde_json::Value, priority: i32, now: u64) -> u64 {
        let mut inner = self.inner.lock().expect("task store mutex poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        let _ = inner.tasks.insert(
            id,
            Task {
                id,
                batch,
                item_id,
                params,
                priority,
                screenshot: false,
                retry_count: 0,
                state: TaskState::Pending,
                owner: None,
                updated_at: now,
            },
        );
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pulls_highest_priority_first() {
        let store = InMemoryTaskStore::new();
        let _ = store.enqueue("b".into(), "i1".into(), json!({}), 0, 0).await;
        let high = store.enqueue("b".into(), "i2".into(), json!({}), 10, 0).await;
        let claimed = store.pull("w1", 1, 10).await;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, high);
    }

    #[tokio::test]
    async fn failed_result_requeues_until_retry_ceiling() {
        let store = InMemoryTaskStore::new();
        let id = store.enqueue("b".into(), "i1".into(), json!({}), 0, 0).await;
        let _ = store.pull("w1", 1, 0).await;
        store
            .submit_results(
                vec![TaskResult { task_id: id, worker_id: "w1".into(), success: false, result: None, error_type: Some("timeout".into()), error_detail: None }],
                3,
                10,
            )
            .await;
        let (pending, _) = store.counts().await;
        assert_eq!(pending, 1);

        for attempt in 0..2 {
            let _ = store.pull("w1", 1, 10 + attempt).await;
            store
                .submit_results(
                    vec![TaskResult { task_id: id, worker_id: "w1".into(), success: false, result: None, error_type: Some("timeout".into()), error_detail: None }],
                    3,
                    20 + attempt,
                )
                .await;
        }
        let (pending, processing) = store.counts().await;
        assert_eq!(pending, 0);
        assert_eq!(processing, 0); // terminally failed, neither pending nor processing
    }

    #[tokio::test]
    async fn success_is_idempotent_per_task_id() {
        let store = InMemoryTaskStore::new();
        let id = store.enqueue("b".into(), "i1".into(), json!({}), 0, 0).await;
        let _ = store.pull("w1", 1, 0).await;
        let result = TaskResult { task_id: id, worker_id: "w1".into(), success: true, result: Some(json!({})), error_type: None, error_detail: None };
        store.submit_results(vec![result.clone()], 3, 10).await;
        store.submit_results(vec![result], 3, 20).await; // duplicate delivery, must not resurrect
        let (pending, processing) = store.counts().await;
        assert_eq!(pending, 0);
        assert_eq!(processing, 0);
    }

    #[tokio::test]
    async fn sweep_returns_stale_processing_tasks_to_pending() {
        let store = InMemoryTaskStore::new();
        let _ = store.enqueue("b".into(), "i1".into(), json!({}), 0, 0).await;
        let _ = store.pull("w1", 1, 0).await;
        let swept = store.sweep(300, 301).await;
        assert_eq!(swept, 1);
        let (pending, processing) = store.counts().await;
        assert_eq!(pending, 1);
        assert_eq!(processing, 0);
    }

    #[tokio::test]
    async fn concurrent_pulls_never_overlap() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryTaskStore::new());
        for i in 0..50 {
            let _ = store.enqueue("b".into(), format!("i{i}"), json!({}), 0, 0).await;
        }
        let mut handles = Vec::new();
        for w in 0..5 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.pull(&format!("w{w}"), 10, 0).await }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for task in handle.await.expect("join") {
                assert!(seen.insert(task.id), "task {} claimed twice", task.id);
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn release_resets_to_pending() {
        let store = InMemoryTaskStore::new();
        let id = store.enqueue("b".into(), "i1".into(), json!({}), 0, 0).await;
        let _ = store.pull("w1", 1, 0).await;
        store.release(&[id], 5).await;
        let (pending, processing) = store.counts().await;
        assert_eq!(pending, 1);
        assert_eq!(processing, 0);
    }
}
