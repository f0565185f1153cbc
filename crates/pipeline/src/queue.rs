//! The worker's local task buffer (§4.F item 1).
//!
//! A plain FIFO would let a burst of high-priority tasks sit behind a
//! backlog of low-priority ones pulled earlier. Incoming batches are
//! therefore priority-insertion-sorted, and when a batch would overflow
//! the configured capacity, the lowest-priority tail is evicted and
//! handed back to the caller to release to the coordinator rather than
//! silently dropped (§8 invariant 8).

use std::collections::VecDeque;
use std::time::Duration;

use model::Task;
use tokio::sync::{Mutex, Notify};

/// A priority-ordered local buffer of claimed-but-not-yet-processed
/// tasks, bounded to `capacity`.
pub struct LocalQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Task>>,
    notify: Notify,
}

impl LocalQueue {
    /// Creates an empty queue bounded to `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Current number of buffered tasks.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Inserts `tasks` in priority order (higher `priority` first, ties
    /// broken by arrival order), evicting the lowest-priority tail tasks
    /// that no longer fit. Returns the evicted tasks' ids, which the
    /// caller must release back to the coordinator.
    pub async fn push_many(&self, tasks: Vec<Task>) -> Vec<u64> {
        let mut guard = self.inner.lock().await;
        Self::insert_sorted(&mut guard, tasks);
        let evicted = Self::evict_overflow(&mut guard, self.capacity);
        drop(guard);
        self.notify.notify_waiters();
        evicted
    }

    /// Like [`Self::push_many`], but if `tasks` contains any
    /// `priority > 0` task and the queue is currently non-empty, the
    /// entire existing queue is drained first (§4.F item 1, §8 invariant
    /// 8: a priority arrival preempts the whole backlog rather than
    /// merely jumping ahead of it). Returns the ids of every task the
    /// caller must release back to the coordinator: both the preempted
    /// backlog and any capacity-overflow tail.
    pub async fn push_many_preempting(&self, tasks: Vec<Task>) -> Vec<u64> {
        let mut guard = self.inner.lock().await;
        let mut evicted = Vec::new();
        if !guard.is_empty() && tasks.iter().any(|t| t.priority > 0) {
            evicted.extend(guard.drain(..).map(|t| t.id));
        }
        Self::insert_sorted(&mut guard, tasks);
        evicted.extend(Self::evict_overflow(&mut guard, self.capacity));
        drop(guard);
        self.notify.notify_waiters();
        evicted
    }

    fn insert_sorted(guard: &mut VecDeque<Task>, tasks: Vec<Task>) {
        for task in tasks {
            let position = guard.iter().position(|queued| queued.priority < task.priority);
            match position {
                Some(index) => guard.insert(index, task),
                None => guard.push_back(task),
            }
        }
    }

    fn evict_overflow(guard: &mut VecDeque<Task>, capacity: usize) -> Vec<u64> {
        let mut evicted = Vec::new();
        while guard.len() > capacity {
            if let Some(task) = guard.pop_back() {
                evicted.push(task.id);
            } else {
                break;
            }
        }
        evicted
    }

    /// Re-queues a single task (a retry), preserving priority order.
    pub async fn push_front_retry(&self, task: Task) {
        let mut guard = self.inner.lock().await;
        let position = guard.iter().position(|queued| queued.priority < task.priority);
        match position {
            Some(index) => guard.insert(index, task),
            None => guard.push_back(task),
        }
        drop(guard);
        self.notify.notify_one();
    }

    /// Pops the highest-priority task, suspending until one is available.
    pub async fn pop(&self) -> Task {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(task) = guard.pop_front() {
                    return task;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Like [`Self::pop`], but gives up and returns `None` if nothing
    /// arrives within `timeout` (§4.F item 3: "acquire controller
    /// semaphore, then dequeue with a 5s timeout"), so a processing loop
    /// periodically gets control back to check whether it's been told to
    /// stop instead of blocking indefinitely on an empty queue.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Task> {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(task) = guard.pop_front() {
                    return Some(task);
                }
            }
            if tokio::time::timeout(timeout, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    /// Drains every buffered task (used on shutdown to release work back
    /// to the coordinator rather than leak it).
    pub async fn drain_all(&self) -> Vec<Task> {
        self.inner.lock().await.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::TaskState;

    fn task(id: u64, priority: i32) -> Task {
        Task {
            id,
            batch: "b".into(),
            item_id: "i".into(),
            params: serde_json::Value::Null,
            priority,
            screenshot: false,
            retry_count: 0,
            state: TaskState::Processing,
            owner: Some("w1".into()),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn pops_highest_priority_first() {
        let queue = LocalQueue::new(10);
        let _ = queue.push_many(vec![task(1, 0), task(2, 5), task(3, 1)]).await;
        assert_eq!(queue.pop().await.id, 2);
        assert_eq!(queue.pop().await.id, 3);
        assert_eq!(queue.pop().await.id, 1);
    }

    #[tokio::test]
    async fn overflow_evicts_lowest_priority_tail() {
        let queue = LocalQueue::new(2);
        let evicted = queue.push_many(vec![task(1, 0), task(2, 5), task(3, 10)]).await;
        assert_eq!(evicted, vec![1]);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn priority_arrival_preempts_the_whole_backlog() {
        let queue = LocalQueue::new(10);
        let _ = queue.push_many(vec![task(1, 0), task(2, 0)]).await;
        let evicted = queue.push_many_preempting(vec![task(3, 5)]).await;
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.pop().await.id, 3);
    }

    #[tokio::test]
    async fn same_priority_arrival_does_not_preempt() {
        let queue = LocalQueue::new(10);
        let _ = queue.push_many(vec![task(1, 0)]).await;
        let evicted = queue.push_many_preempting(vec![task(2, 0)]).await;
        assert!(evicted.is_empty());
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_empty() {
        let queue = LocalQueue::new(10);
        let popped = queue.pop_timeout(std::time::Duration::from_millis(20)).await;
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let queue = std::sync::Arc::new(LocalQueue::new(10));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let _ = queue.push_many(vec![task(7, 0)]).await;
        let popped = popper.await.expect("task panicked");
        assert_eq!(popped.id, 7);
    }
}
