//! Per-request outcomes and the derived read-only snapshot over them.
//!
//! The window that accumulates [`RequestOutcome`] values and produces a
//! [`MetricsSnapshot`] lives in the `metrics` crate; this module only
//! defines the shapes both sides agree on.

use serde::{Deserialize, Serialize};

/// An immutable record of one completed HTTP attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Monotonic timestamp (seconds since an arbitrary epoch), used only
    /// for window pruning and ordering, never wall-clock semantics.
    pub at: f64,
    /// Request latency in seconds.
    pub latency_s: f64,
    /// Whether the attempt succeeded (2xx with a parseable page, in the
    /// worker's judgement -- parse failures are success=false but
    /// blocked=false, see `pipeline`'s error classification).
    pub success: bool,
    /// Whether the attempt was classified as anti-bot interference.
    pub blocked: bool,
    /// Response body size in bytes (0 if the attempt never received one).
    pub bytes: u64,
}

/// A read-only, point-in-time view over a metrics window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total outcomes retained in the window.
    pub count: usize,
    /// Fraction of outcomes with `success == true`. 1.0 when the window
    /// is empty (the controller's "no signal yet" bias).
    pub success_rate: f64,
    /// Fraction of outcomes with `blocked == true`.
    pub block_rate: f64,
    /// Linear-interpolated 50th percentile latency, in seconds.
    pub p50_latency_s: f64,
    /// Linear-interpolated 95th percentile latency, in seconds.
    pub p95_latency_s: f64,
    /// Bytes per second over the window.
    pub bytes_per_sec: f64,
    /// Bandwidth utilisation against a configured budget, in `[0, 1+]`.
    pub bandwidth_pct: f64,
    /// Requests currently in flight (tracked independently of the window).
    pub in_flight: u64,
    /// Wall-clock span, in seconds, actually covered by retained samples.
    pub window_span_s: f64,
}

impl MetricsSnapshot {
    /// The snapshot returned by an empty window: full success, zero
    /// latency, zero bandwidth. Deliberately biases the AIMD controller
    /// to neither accelerate nor decelerate before it has real signal.
    #[must_use]
    pub fn empty(in_flight: u64) -> Self {
        Self {
            count: 0,
            success_rate: 1.0,
            block_rate: 0.0,
            p50_latency_s: 0.0,
            p95_latency_s: 0.0,
            bytes_per_sec: 0.0,
            bandwidth_pct: 0.0,
            in_flight,
            window_span_s: 0.0,
        }
    }
}
