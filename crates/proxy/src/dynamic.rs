//! A [`ProxySource`] that can be atomically swapped for another at
//! runtime, so a settings-driven mode switch (§4.H step 1: "a mode
//! change reinitialises the proxy manager, draining in-flight requests
//! against the old one first") doesn't require restarting the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Error, ProxyManager, ProxySource, ProxyStats};

/// Wraps an [`Arc<ProxyManager>`] behind a lock so it can be swapped out
/// from under in-flight callers. Callers always see either the old or
/// the new manager for a given call, never a torn mix of both.
pub struct DynamicProxySource {
    inner: RwLock<Arc<ProxyManager>>,
}

impl DynamicProxySource {
    /// Wraps an initial manager.
    #[must_use]
    pub fn new(initial: ProxyManager) -> Self {
        Self { inner: RwLock::new(Arc::new(initial)) }
    }

    /// Replaces the active manager. Any call already in flight against
    /// the old manager runs to completion; new calls see `replacement`.
    pub async fn swap(&self, replacement: ProxyManager) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(replacement);
    }

    /// Returns a clone of the currently active manager, for the
    /// tunnel-only background rotation task to drive directly.
    pub async fn current(&self) -> Arc<ProxyManager> {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl ProxySource for DynamicProxySource {
    async fn get_proxy(&self, channel: Option<u32>) -> Result<(String, Option<u32>), Error> {
        let manager = self.inner.read().await.clone();
        manager.get_proxy(channel).await
    }

    async fn report_blocked(&self, channel: Option<u32>) -> Result<(), Error> {
        let manager = self.inner.read().await.clone();
        manager.report_blocked(channel).await
    }

    async fn stats(&self) -> ProxyStats {
        let manager = self.inner.read().await.clone();
        manager.stats().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tps::TpsProxyManager;

    fn empty_tps() -> ProxyManager {
        ProxyManager::Tps(TpsProxyManager::new(reqwest::Client::new(), String::new(), Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn swap_replaces_the_active_manager() {
        let source = DynamicProxySource::new(empty_tps());
        assert!(source.current().await.as_tunnel().is_none());
        source.swap(empty_tps()).await;
        assert!(source.current().await.as_tunnel().is_none());
    }
}
