//! A concurrency-limiting semaphore that can be resized at runtime.
//!
//! `tokio::sync::Semaphore` has no shrink primitive (§9's own design
//! note). Growth tops up the current semaphore in place; shrink swaps in
//! a freshly sized one. Permits already handed out against the old
//! semaphore remain valid until their holder drops them -- a gradual,
//! non-preemptive shrink, exactly as the spec requires.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

struct Inner {
    semaphore: Arc<Semaphore>,
    target: u32,
}

/// A resizable `tokio::sync::Semaphore` wrapper.
pub struct ResizableSemaphore {
    inner: Mutex<Inner>,
}

impl ResizableSemaphore {
    /// Creates a semaphore starting at `initial` permits.
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                semaphore: Arc::new(Semaphore::new(initial as usize)),
                target: initial,
            }),
        }
    }

    /// The currently configured target capacity. Note this is the target,
    /// not `available_permits()`, which is meaningless once permits are
    /// outstanding against a now-discarded generation.
    pub async fn target(&self) -> u32 {
        self.inner.lock().await.target
    }

    /// Resizes the semaphore. Growth adds permits to the live semaphore
    /// in place; shrink replaces it with a smaller one, atomically with
    /// respect to the stored target so concurrent evaluators never race.
    pub async fn resize(&self, new_target: u32) {
        let mut inner = self.inner.lock().await;
        if new_target > inner.target {
            inner.semaphore.add_permits((new_target - inner.target) as usize);
        } else if new_target < inner.target {
            inner.semaphore = Arc::new(Semaphore::new(new_target as usize));
        }
        inner.target = new_target;
    }

    /// Acquires one permit, suspending until one is available. The
    /// semaphore snapshot is taken under the lock and the wait happens
    /// outside it, so a concurrent resize never blocks on an in-flight
    /// acquisition.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let semaphore = { self.inner.lock().await.semaphore.clone() };
        semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never explicitly closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn growth_admits_more_concurrent_holders() {
        let sem = ResizableSemaphore::new(2);
        let p1 = sem.acquire().await;
        let p2 = sem.acquire().await;
        sem.resize(3).await;
        let p3 = sem.acquire().await;
        drop((p1, p2, p3));
    }

    #[tokio::test]
    async fn shrink_does_not_revoke_outstanding_permits() {
        let sem = ResizableSemaphore::new(2);
        let held = sem.acquire().await;
        sem.resize(1).await;
        // The held permit from the old generation is still valid; it is
        // simply discarded (not returned to the new generation) on drop.
        drop(held);
        assert_eq!(sem.target().await, 1);
        let _new_gen = sem.acquire().await;
    }
}
