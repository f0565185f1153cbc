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

//! Sliding-window metrics collector (§4.A).
//!
//! `Record` is O(1) amortised; pruning of samples older than the window
//! happens lazily on every mutation and every read, under one mutex, the
//! same "a single mutex around append+prune is acceptable" allowance the
//! base's `engine::controllers` module relies on for its own shared state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use model::{MetricsSnapshot, RequestOutcome};

/// Window length, in seconds (§4.A).
pub const WINDOW_SECONDS: f64 = 30.0;

/// Minimum number of samples the AIMD controller requires before acting;
/// enforced by the caller, not by this window, but exposed here since the
/// empty/low-signal bias originates from the window's own semantics.
pub const MIN_SAMPLES_FOR_DECISION: usize = 5;

struct Sample {
    at: Instant,
    outcome: RequestOutcome,
}

struct Inner {
    samples: VecDeque<Sample>,
}

/// A sliding-window aggregator of [`RequestOutcome`] values.
pub struct MetricsWindow {
    window: std::time::Duration,
    bandwidth_budget_bytes_per_sec: f64,
    inner: Mutex<Inner>,
    in_flight: AtomicU64,
}

impl MetricsWindow {
    /// A new window of the default 30s length.
    #[must_use]
    pub fn new(bandwidth_budget_bytes_per_sec: f64) -> Self {
        Self::with_window(
            std::time::Duration::from_secs_f64(WINDOW_SECONDS),
            bandwidth_budget_bytes_per_sec,
        )
    }

    /// A window with a caller-chosen length, for tests that want to
    /// observe pruning without sleeping 30 real seconds.
    #[must_use]
    pub fn with_window(window: std::time::Duration, bandwidth_budget_bytes_per_sec: f64) -> Self {
        Self {
            window,
            bandwidth_budget_bytes_per_sec,
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
            }),
            in_flight: AtomicU64::new(0),
        }
    }

    /// Marks a request as started. Pairs with [`Self::request_end`];
    /// `RequestStart`/`RequestEnd` nest per task but are otherwise
    /// independent of `record`.
    pub fn request_start(&self) {
        let _ = self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a request as finished, regardless of outcome.
    pub fn request_end(&self) {
        let _ = self.in_flight.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    /// Appends one completed outcome. O(1) amortised.
    pub fn record(&self, outcome: RequestOutcome) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("metrics window mutex poisoned");
        inner.samples.push_back(Sample { at: now, outcome });
        prune(&mut inner.samples, now, self.window);
    }

    /// Returns a consistent snapshot of the last `W` seconds.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("metrics window mutex poisoned");
        prune(&mut inner.samples, now, self.window);

        if inner.samples.is_empty() {
            return MetricsSnapshot::empty(in_flight);
        }

        let count = inner.samples.len();
        let mut latencies: Vec<f64> = inner.samples.iter().map(|s| s.outcome.latency_s).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).expect("latency is never NaN"));

        let success_count = inner.samples.iter().filter(|s| s.outcome.success).count();
        let blocked_count = inner.samples.iter().filter(|s| s.outcome.blocked).count();
        let total_bytes: u64 = inner.samples.iter().map(|s| s.outcome.bytes).sum();

        let oldest = inner
            .samples
            .front()
            .map(|s| now.duration_since(s.at).as_secs_f64())
            .unwrap_or(0.0);
        let span = oldest.max(f64::EPSILON);

        let bytes_per_sec = total_bytes as f64 / span;

        MetricsSnapshot {
            count,
            success_rate: success_count as f64 / count as f64,
            block_rate: blocked_count as f64 / count as f64,
            p50_latency_s: percentile(&latencies, 0.50),
            p95_latency_s: percentile(&latencies, 0.95),
            bytes_per_sec,
            bandwidth_pct: if self.bandwidth_budget_bytes_per_sec > 0.0 {
                bytes_per_sec / self.bandwidth_budget_bytes_per_sec
            } else {
                0.0
            },
            in_flight,
            window_span_s: span,
        }
    }
}

fn prune(samples: &mut VecDeque<Sample>, now: Instant, window: std::time::Duration) {
    while let Some(front) = samples.front() {
        if now.duration_since(front.at) > window {
            let _ = samples.pop_front();
        } else {
            break;
        }
    }
}

/// Linear interpolation between the two nearest order statistics, per
/// §4.A / §8 invariant 6. `sorted` must already be sorted ascending and
/// non-empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(latency_s: f64, success: bool, blocked: bool, bytes: u64) -> RequestOutcome {
        RequestOutcome {
            at: 0.0,
            latency_s,
            success,
            blocked,
            bytes,
        }
    }

    #[test]
    fn empty_window_biases_towards_accelerate() {
        let window = MetricsWindow::new(0.0);
        let snap = window.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.success_rate, 1.0);
        assert_eq!(snap.p50_latency_s, 0.0);
    }

    #[test]
    fn percentile_matches_linear_interpolation() {
        // Sorted sample 1..=10: p50 rank = 0.5*9 = 4.5 -> between index 4
        // (value 5) and index 5 (value 6) -> 5.5.
        let sorted: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(percentile(&sorted, 0.50), 5.5);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 10.0);
    }

    #[test]
    fn record_is_reflected_in_next_snapshot() {
        let window = MetricsWindow::new(1_000_000.0);
        for _ in 0..10 {
            window.record(outcome(1.0, true, false, 1024));
        }
        let snap = window.snapshot();
        assert_eq!(snap.count, 10);
        assert_eq!(snap.success_rate, 1.0);
        assert_eq!(snap.block_rate, 0.0);
    }

    #[test]
    fn block_rate_reflects_blocked_fraction() {
        let window = MetricsWindow::new(0.0);
        for _ in 0..9 {
            window.record(outcome(1.0, true, false, 0));
        }
        window.record(outcome(1.0, false, true, 0));
        let snap = window.snapshot();
        assert!((snap.block_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn in_flight_counter_is_independent_of_recorded_samples() {
        let window = MetricsWindow::new(0.0);
        window.request_start();
        window.request_start();
        let snap = window.snapshot();
        assert_eq!(snap.in_flight, 2);
        window.request_end();
        let snap = window.snapshot();
        assert_eq!(snap.in_flight, 1);
    }

    #[test]
    fn samples_older_than_window_are_pruned() {
        let window = MetricsWindow::with_window(std::time::Duration::from_millis(20), 0.0);
        window.record(outcome(1.0, true, false, 0));
        std::thread::sleep(std::time::Duration::from_millis(40));
        window.record(outcome(2.0, true, false, 0));
        let snap = window.snapshot();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.p50_latency_s, 2.0);
    }
}
