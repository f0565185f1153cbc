//! Applies one `SyncResponse` to the worker's local controllers, in the
//! exact order §4.H requires: settings deltas, then quota, then
//! block-state, then jitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use aimd::{AimdController, Thresholds};
use model::wire::SyncResponse;
use model::ProxyMode;
use proxy::DynamicProxySource;
use ratelimit::TokenBucket;
use tracing::info;

use crate::factory::ProxyManagerFactory;

/// Everything one worker needs applied to it on every sync round.
pub struct WorkerSyncState {
    controller: std::sync::Arc<AimdController>,
    rate_limiter: std::sync::Arc<TokenBucket>,
    proxy: std::sync::Arc<DynamicProxySource>,
    factory: std::sync::Arc<dyn ProxyManagerFactory>,
    last_settings_version: AtomicU64,
    last_block_epoch: AtomicU64,
    last_mode: Mutex<Option<ProxyMode>>,
}

impl WorkerSyncState {
    /// Creates the apply-side state. `initial_mode` should match
    /// whatever mode the worker booted the proxy manager with.
    #[must_use]
    pub fn new(
        controller: std::sync::Arc<AimdController>,
        rate_limiter: std::sync::Arc<TokenBucket>,
        proxy: std::sync::Arc<DynamicProxySource>,
        factory: std::sync::Arc<dyn ProxyManagerFactory>,
        initial_mode: ProxyMode,
    ) -> Self {
        Self {
            controller,
            rate_limiter,
            proxy,
            factory,
            last_settings_version: AtomicU64::new(0),
            last_block_epoch: AtomicU64::new(0),
            last_mode: Mutex::new(Some(initial_mode)),
        }
    }

    /// Applies `response` in the §4.H order. Returns `true` if the
    /// settings version advanced (useful for callers that want to log a
    /// settings change distinctly from a routine quota refresh).
    pub async fn apply(&self, response: &SyncResponse) -> bool {
        let settings = &response.settings;
        let advanced = settings.version > self.last_settings_version.load(Ordering::Relaxed);

        if advanced {
            self.controller
                .apply_thresholds(Thresholds {
                    block_threshold: settings.block_rate_threshold,
                    min_success: settings.min_success_rate,
                    max_latency_s: settings.max_latency_s,
                    target_success: settings.target_success_rate,
                    target_latency_s: settings.target_latency_s,
                    cooldown_s: u64::from(settings.cooldown_after_block_s),
                })
                .await;
            self.controller.set_mode(settings.proxy_mode).await;
            self.rate_limiter.set_rate(settings.token_bucket_rate).await;

            let mode_changed = {
                let mut last_mode = self.last_mode.lock().expect("last_mode mutex poisoned");
                let changed = *last_mode != Some(settings.proxy_mode);
                *last_mode = Some(settings.proxy_mode);
                changed
            };
            if mode_changed {
                info!(mode = ?settings.proxy_mode, "worker-sync: proxy mode changed, reinitialising manager");
                let replacement = self.factory.build(settings).await;
                self.proxy.swap(replacement).await;
            }

            self.last_settings_version.store(settings.version, Ordering::Relaxed);
        }

        // Step 2: the quota is always authoritative, settings version or
        // not.
        self.controller.apply_quota_ceiling(response.quota.concurrency).await;
        self.rate_limiter.set_rate(response.quota.qps).await;

        // Step 3: global-block epoch transition.
        if response.block.epoch > self.last_block_epoch.load(Ordering::Relaxed) {
            self.last_block_epoch.store(response.block.epoch, Ordering::Relaxed);
            self.controller.apply_global_block(response.block.remaining_s).await;
        }

        // Step 4: recovery jitter, unconditionally.
        self.controller.set_jitter(response.block.recovery_jitter).await;

        advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::MetricsWindow;
    use model::quota::{GlobalBlockDescriptor, Quota};
    use model::RuntimeSettings;
    use proxy::tps::TpsProxyManager;
    use proxy::ProxyManager;
    use std::sync::Arc;
    use std::time::Duration;

    struct NullFactory;

    #[async_trait::async_trait]
    impl ProxyManagerFactory for NullFactory {
        async fn build(&self, _settings: &RuntimeSettings) -> ProxyManager {
            ProxyManager::Tps(TpsProxyManager::new(reqwest::Client::new(), String::new(), Duration::from_secs(60)))
        }
    }

    fn state() -> WorkerSyncState {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        let controller = Arc::new(AimdController::new(
            8,
            2,
            40,
            ProxyMode::Tps,
            Thresholds {
                block_threshold: 0.05,
                min_success: 0.85,
                max_latency_s: 8.0,
                target_success: 0.95,
                target_latency_s: 2.0,
                cooldown_s: 30,
            },
            metrics,
        ));
        let rate_limiter = Arc::new(TokenBucket::new(5.0));
        let proxy = Arc::new(DynamicProxySource::new(ProxyManager::Tps(TpsProxyManager::new(
            reqwest::Client::new(),
            String::new(),
            Duration::from_secs(60),
        ))));
        WorkerSyncState::new(controller, rate_limiter, proxy, Arc::new(NullFactory), ProxyMode::Tps)
    }

    fn response(version: u64, epoch: u64, concurrency: u32, qps: f64, mode: ProxyMode) -> SyncResponse {
        let mut settings = RuntimeSettings::default();
        settings.version = version;
        settings.proxy_mode = mode;
        SyncResponse {
            settings,
            quota: Quota { concurrency, qps, assigned_at: 0 },
            block: GlobalBlockDescriptor { active: epoch > 0, remaining_s: if epoch > 0 { 30 } else { 0 }, triggered_by: None, epoch, recovery_jitter: 0.7 },
        }
    }

    #[tokio::test]
    async fn quota_ceiling_shrinks_concurrency_immediately() {
        let state = state();
        let _ = state.apply(&response(1, 0, 3, 2.0, ProxyMode::Tps)).await;
        assert_eq!(state.controller.current_concurrency().await, 3);
        assert_eq!(state.rate_limiter.rate().await, 2.0);
    }

    #[tokio::test]
    async fn stale_settings_version_is_not_reapplied() {
        let state = state();
        assert!(state.apply(&response(1, 0, 8, 5.0, ProxyMode::Tps)).await);
        assert!(!state.apply(&response(1, 0, 8, 5.0, ProxyMode::Tps)).await);
    }

    #[tokio::test]
    async fn new_epoch_halves_concurrency_once() {
        let state = state();
        let _ = state.apply(&response(1, 0, 10, 5.0, ProxyMode::Tps)).await;
        let _ = state.apply(&response(1, 1, 10, 5.0, ProxyMode::Tps)).await;
        assert_eq!(state.controller.current_concurrency().await, 5);
    }

    #[tokio::test]
    async fn mode_switch_swaps_proxy_manager() {
        let state = state();
        let _ = state.apply(&response(1, 0, 8, 5.0, ProxyMode::Tunnel)).await;
        assert!(state.proxy.current().await.as_tunnel().is_none(), "factory stub always returns TPS");
        let last_mode = *state.last_mode.lock().unwrap();
        assert_eq!(last_mode, Some(ProxyMode::Tunnel));
    }
}
