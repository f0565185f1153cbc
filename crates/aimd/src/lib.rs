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

//! TCP-Reno-style AIMD concurrency controller (§4.E).

pub mod semaphore;

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{MetricsWindow, MIN_SAMPLES_FOR_DECISION};
use model::ProxyMode;
use tokio::sync::{Mutex, OwnedSemaphorePermit};

use semaphore::ResizableSemaphore;

/// Utilisation threshold above which the controller holds rather than
/// increases (§4.E rule #3).
pub const SOFT_CAP: f64 = 0.80;

/// Multiplicative-decrease factor in TPS mode: a block affects every
/// worker, so halve aggressively.
pub const TPS_DECREASE_FACTOR: f64 = 0.5;
/// Multiplicative-decrease factor in tunnel mode: a block affects only
/// one of N channels.
pub const TUNNEL_DECREASE_FACTOR: f64 = 0.75;
/// Default cooldown after a block-triggered decrease, TPS mode.
pub const TPS_DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
/// Default cooldown after a block-triggered decrease, tunnel mode.
pub const TUNNEL_DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Tunable thresholds driving the decision table. Everything here maps
/// directly onto a `model::RuntimeSettings` field of the same intent.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Block rate above which rule #1 fires.
    pub block_threshold: f64,
    /// Success rate floor for rule #2.
    pub min_success: f64,
    /// p50 latency ceiling for rule #2, seconds.
    pub max_latency_s: f64,
    /// Success rate target for rule #5.
    pub target_success: f64,
    /// p50 latency target for rule #5, seconds.
    pub target_latency_s: f64,
    /// Cooldown length applied by rules #1/#2, seconds. Defaults to the
    /// mode-specific constant above but is coordinator-tunable.
    pub cooldown_s: u64,
}

/// The outcome of one evaluation tick, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No action: too few samples.
    InsufficientSamples,
    /// Rule #1: block-rate decrease.
    DecreaseOnBlock,
    /// Rule #2: success/latency decrease.
    DecreaseOnHealth,
    /// Rule #3: bandwidth soft cap, hold.
    HoldOnBandwidth,
    /// Rule #4: cooldown active, hold.
    HoldOnCooldown,
    /// Rule #5, probability hit: additive increase.
    Increase,
    /// Rule #5, probability miss, or rule #6: hold.
    Hold,
}

struct State {
    c: u32,
    cooldown_until: Instant,
    jitter: f64,
}

/// Per-worker AIMD controller: current concurrency target, resizable
/// semaphore, cooldown timer.
pub struct AimdController {
    c_min: u32,
    c_max: Mutex<u32>,
    mode: Mutex<ProxyMode>,
    thresholds: Mutex<Thresholds>,
    metrics: Arc<MetricsWindow>,
    state: Mutex<State>,
    semaphore: ResizableSemaphore,
}

impl AimdController {
    /// Creates a controller with `initial` clamped into `[c_min, c_max]`.
    #[must_use]
    pub fn new(
        initial: u32,
        c_min: u32,
        c_max: u32,
        mode: ProxyMode,
        thresholds: Thresholds,
        metrics: Arc<MetricsWindow>,
    ) -> Self {
        let initial = initial.clamp(c_min, c_max);
        Self {
            c_min,
            c_max: Mutex::new(c_max),
            mode: Mutex::new(mode),
            thresholds: Mutex::new(thresholds),
            metrics,
            state: Mutex::new(State {
                c: initial,
                cooldown_until: Instant::now(),
                jitter: 0.5,
            }),
            semaphore: ResizableSemaphore::new(initial),
        }
    }

    /// Current concurrency target.
    pub async fn current_concurrency(&self) -> u32 {
        self.state.lock().await.c
    }

    /// Acquires one concurrency permit, suspending if at capacity.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore.acquire().await
    }

    /// Sets the recovery jitter received from the coordinator (§4.H step
    /// 4), consumed by rule #5's probability calculation.
    pub async fn set_jitter(&self, jitter: f64) {
        self.state.lock().await.jitter = jitter.clamp(0.0, 1.0);
    }

    /// Applies a coordinator-assigned quota ceiling (§4.H step 2): sets
    /// `C_max` and, if the current `C` exceeds it, shrinks immediately.
    pub async fn apply_quota_ceiling(&self, new_c_max: u32) {
        *self.c_max.lock().await = new_c_max;
        let mut state = self.state.lock().await;
        if state.c > new_c_max {
            state.c = new_c_max.max(self.c_min);
            self.semaphore.resize(state.c).await;
        }
    }

    /// Applies updated AIMD thresholds from a newer settings version.
    pub async fn apply_thresholds(&self, thresholds: Thresholds) {
        *self.thresholds.lock().await = thresholds;
    }

    /// Hot-switches proxy mode (TPS <-> tunnel), changing which
    /// decrease factor and default cooldown rules #1/#2 use.
    pub async fn set_mode(&self, mode: ProxyMode) {
        *self.mode.lock().await = mode;
    }

    /// Applies a global-block epoch transition (§4.H step 3): halves `C`
    /// (floored at `C_min`) and sets a local cooldown for `remaining_s`.
    pub async fn apply_global_block(&self, remaining_s: u64) {
        let mut state = self.state.lock().await;
        state.c = ((state.c as f64 * 0.5).floor() as u32).max(self.c_min);
        state.cooldown_until = Instant::now() + Duration::from_secs(remaining_s);
        drop(state);
        self.resize_to_current().await;
    }

    async fn resize_to_current(&self) {
        let c = self.state.lock().await.c;
        self.semaphore.resize(c).await;
    }

    /// Runs one evaluation tick (§4.E). Returns the rule that fired, for
    /// logging and tests; does nothing but return
    /// [`Decision::InsufficientSamples`] if the window has too few
    /// samples to act on.
    pub async fn evaluate(&self) -> Decision {
        let snapshot = self.metrics.snapshot();
        if snapshot.count < MIN_SAMPLES_FOR_DECISION {
            return Decision::InsufficientSamples;
        }

        let thresholds = *self.thresholds.lock().await;
        let mode = *self.mode.lock().await;
        let c_max = *self.c_max.lock().await;
        let now = Instant::now();

        let (decrease_factor, default_cooldown) = match mode {
            ProxyMode::Tps => (TPS_DECREASE_FACTOR, TPS_DEFAULT_COOLDOWN),
            ProxyMode::Tunnel => (TUNNEL_DECREASE_FACTOR, TUNNEL_DEFAULT_COOLDOWN),
        };
        let cooldown = if thresholds.cooldown_s > 0 {
            Duration::from_secs(thresholds.cooldown_s)
        } else {
            default_cooldown
        };

        // Priority 1: block rate.
        if snapshot.block_rate > thresholds.block_threshold {
            let mut state = self.state.lock().await;
            state.c = ((state.c as f64 * decrease_factor).floor() as u32).max(self.c_min);
            state.cooldown_until = now + cooldown;
            drop(state);
            self.resize_to_current().await;
            tracing::info!(block_rate = snapshot.block_rate, new_c = self.current_concurrency().await, "aimd: decrease on block");
            return Decision::DecreaseOnBlock;
        }

        // Priority 2: success rate / latency health.
        if snapshot.success_rate < thresholds.min_success || snapshot.p50_latency_s > thresholds.max_latency_s {
            let mut state = self.state.lock().await;
            state.c = ((state.c as f64 * decrease_factor).floor() as u32).max(self.c_min);
            drop(state);
            self.resize_to_current().await;
            tracing::info!(success_rate = snapshot.success_rate, p50 = snapshot.p50_latency_s, new_c = self.current_concurrency().await, "aimd: decrease on health");
            return Decision::DecreaseOnHealth;
        }

        // Priority 3: bandwidth soft cap.
        if snapshot.bandwidth_pct > SOFT_CAP {
            return Decision::HoldOnBandwidth;
        }

        // Priority 4: existing cooldown.
        let in_cooldown = { now < self.state.lock().await.cooldown_until };
        if in_cooldown {
            return Decision::HoldOnCooldown;
        }

        // Priority 5: healthy, maybe increase.
        if snapshot.success_rate >= thresholds.target_success && snapshot.p50_latency_s < thresholds.target_latency_s {
            let jitter = self.state.lock().await.jitter;
            let probability = 0.3 + 0.7 * jitter;
            if rand::random::<f64>() < probability {
                let mut state = self.state.lock().await;
                state.c = (state.c + 1).min(c_max);
                drop(state);
                self.resize_to_current().await;
                tracing::info!(new_c = self.current_concurrency().await, "aimd: additive increase");
                return Decision::Increase;
            }
            return Decision::Hold;
        }

        // Priority 6: otherwise.
        Decision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::RequestOutcome;

    fn default_thresholds() -> Thresholds {
        Thresholds {
            block_threshold: 0.05,
            min_success: 0.85,
            max_latency_s: 8.0,
            target_success: 0.95,
            target_latency_s: 2.0,
            cooldown_s: 0,
        }
    }

    fn healthy_outcome() -> RequestOutcome {
        RequestOutcome {
            at: 0.0,
            latency_s: 1.0,
            success: true,
            blocked: false,
            bytes: 1024,
        }
    }

    fn blocked_outcome() -> RequestOutcome {
        RequestOutcome {
            at: 0.0,
            latency_s: 1.0,
            success: false,
            blocked: true,
            bytes: 0,
        }
    }

    #[tokio::test]
    async fn too_few_samples_does_nothing() {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        let controller = AimdController::new(8, 2, 40, ProxyMode::Tps, default_thresholds(), metrics);
        assert_eq!(controller.evaluate().await, Decision::InsufficientSamples);
        assert_eq!(controller.current_concurrency().await, 8);
    }

    #[tokio::test]
    async fn block_storm_halves_concurrency_in_tps_mode() {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        for _ in 0..9 {
            metrics.record(healthy_outcome());
        }
        metrics.record(blocked_outcome());
        let controller = AimdController::new(8, 2, 40, ProxyMode::Tps, default_thresholds(), metrics);
        let decision = controller.evaluate().await;
        assert_eq!(decision, Decision::DecreaseOnBlock);
        assert_eq!(controller.current_concurrency().await, 4);
    }

    #[tokio::test]
    async fn tunnel_mode_decreases_less_aggressively() {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        for _ in 0..9 {
            metrics.record(healthy_outcome());
        }
        metrics.record(blocked_outcome());
        let controller = AimdController::new(8, 2, 40, ProxyMode::Tunnel, default_thresholds(), metrics);
        let decision = controller.evaluate().await;
        assert_eq!(decision, Decision::DecreaseOnBlock);
        assert_eq!(controller.current_concurrency().await, 6);
    }

    #[tokio::test]
    async fn cooldown_holds_even_when_healthy() {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        for _ in 0..9 {
            metrics.record(healthy_outcome());
        }
        metrics.record(blocked_outcome());
        let controller = AimdController::new(8, 2, 40, ProxyMode::Tps, default_thresholds(), metrics.clone());
        assert_eq!(controller.evaluate().await, Decision::DecreaseOnBlock);
        for _ in 0..9 {
            metrics.record(healthy_outcome());
        }
        let decision = controller.evaluate().await;
        assert_eq!(decision, Decision::HoldOnCooldown);
    }

    #[tokio::test]
    async fn healthy_traffic_eventually_increases_with_jitter_one() {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        for _ in 0..20 {
            metrics.record(healthy_outcome());
        }
        let controller = AimdController::new(8, 2, 40, ProxyMode::Tps, default_thresholds(), metrics);
        controller.set_jitter(1.0).await; // probability = 1.0, deterministic
        let mut increased = false;
        for _ in 0..5 {
            if controller.evaluate().await == Decision::Increase {
                increased = true;
                break;
            }
        }
        assert!(increased);
    }

    #[tokio::test]
    async fn quota_ceiling_shrinks_immediately_when_exceeded() {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        let controller = AimdController::new(20, 2, 40, ProxyMode::Tps, default_thresholds(), metrics);
        controller.apply_quota_ceiling(5).await;
        assert_eq!(controller.current_concurrency().await, 5);
    }

    #[tokio::test]
    async fn global_block_halves_and_sets_cooldown() {
        let metrics = Arc::new(MetricsWindow::new(0.0));
        let controller = AimdController::new(10, 2, 40, ProxyMode::Tps, default_thresholds(), metrics.clone());
        controller.apply_global_block(30).await;
        assert_eq!(controller.current_concurrency().await, 5);
        for _ in 0..9 {
            metrics.record(healthy_outcome());
        }
        metrics.record(blocked_outcome());
        // Even healthy-ish traffic right after a global block should
        // still be governed by priority 1 if block rate is elevated;
        // otherwise priority 4 (cooldown) holds.
        let decision = controller.evaluate().await;
        assert!(matches!(decision, Decision::DecreaseOnBlock | Decision::HoldOnCooldown));
    }
}
