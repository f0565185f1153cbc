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

//! A fleet- or worker-scoped QPS limiter with a continuous refill model
//! and a runtime-mutable rate (§4.B).

use std::time::Instant;

use tokio::sync::Mutex;
use tokio::time::sleep;

/// Floor below which `rate` is clamped, to avoid division by zero when
/// computing the wait for the next token.
pub const MIN_RATE: f64 = 0.1;

struct State {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl State {
    fn capacity(&self) -> f64 {
        (self.rate.floor()).max(1.0)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity());
        self.last_refill = now;
    }
}

/// A token bucket QPS limiter. `rate` may be changed at any time and
/// takes effect on the very next `acquire` call.
pub struct TokenBucket {
    state: Mutex<State>,
}

impl TokenBucket {
    /// Creates a bucket starting full, at the given rate.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        let rate = rate.max(MIN_RATE);
        let capacity = rate.floor().max(1.0);
        Self {
            state: Mutex::new(State {
                rate,
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until one token is available, then consumes it. At most
    /// one token is consumed per call.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill(now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (1.0 - state.tokens) / state.rate
            };
            sleep(std::time::Duration::from_secs_f64(wait.max(0.0))).await;
        }
    }

    /// Sets the rate immediately. Clamped to `[MIN_RATE, +inf)`; capacity
    /// (the burst size) is `max(1, floor(rate))`.
    pub async fn set_rate(&self, rate: f64) {
        let rate = rate.max(MIN_RATE);
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refill(now);
        state.rate = rate;
        let capacity = state.capacity();
        if state.tokens > capacity {
            state.tokens = capacity;
        }
    }

    /// Current configured rate.
    pub async fn rate(&self) -> f64 {
        self.state.lock().await.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_never_blocks_within_initial_burst() {
        let bucket = TokenBucket::new(5.0);
        for _ in 0..5 {
            let start = Instant::now();
            bucket.acquire().await;
            assert!(start.elapsed() < Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn rate_is_clamped_to_floor() {
        let bucket = TokenBucket::new(0.0);
        assert_eq!(bucket.rate().await, MIN_RATE);
        bucket.set_rate(-5.0).await;
        assert_eq!(bucket.rate().await, MIN_RATE);
    }

    #[tokio::test]
    async fn obeys_rate_over_a_window() {
        // rate=10/s, burst capacity=10; over ~1.2s we expect at most
        // rate*T + burst acquires (invariant 5).
        let bucket = TokenBucket::new(10.0);
        let start = Instant::now();
        let mut count = 0u32;
        while start.elapsed() < Duration::from_millis(1200) {
            bucket.acquire().await;
            count += 1;
        }
        let t = start.elapsed().as_secs_f64();
        assert!(count as f64 <= 10.0 * t + 10.0 + 1.0);
    }

    #[tokio::test]
    async fn set_rate_takes_effect_immediately() {
        let bucket = TokenBucket::new(1.0);
        bucket.acquire().await; // drain the single initial token
        bucket.set_rate(1000.0).await;
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
