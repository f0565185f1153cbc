//! TPS (per-request fresh IP) proxy mode.
//!
//! Grounded on the original Python `ProxyManager`: a single cached proxy
//! refreshed lazily, a single-flight lock around the upstream fetch, a
//! minimum 1s gap between upstream calls, and a capped, bulk-cleared
//! blocklist.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{api, Error, ProxySource, ProxyStats};

const MAX_BLOCKLIST: usize = 100;
const MIN_FETCH_GAP: Duration = Duration::from_secs(1);
const MAX_FETCH_RETRIES: u32 = 3;

struct State {
    current_proxy: Option<String>,
    expire_at: Instant,
    last_fetch_at: Instant,
    blocked: HashSet<String>,
    total_fetched: u64,
    total_errors: u64,
}

/// TPS-mode proxy manager: one cached proxy, refreshed on expiry or on
/// `report_blocked`.
pub struct TpsProxyManager {
    client: reqwest::Client,
    api_url: String,
    refresh_interval: Duration,
    state: Mutex<State>,
}

impl TpsProxyManager {
    /// Creates a manager with an empty cache; the first `get_proxy` call
    /// triggers the initial fetch.
    #[must_use]
    pub fn new(client: reqwest::Client, api_url: String, refresh_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            client,
            api_url,
            refresh_interval,
            state: Mutex::new(State {
                current_proxy: None,
                expire_at: now,
                last_fetch_at: now - MIN_FETCH_GAP,
                blocked: HashSet::new(),
                total_fetched: 0,
                total_errors: 0,
            }),
        }
    }

    /// Fetches a new proxy from the upstream API, serialised by the
    /// single-flight mutex. Retries up to 3 times with exponential
    /// backoff on transport failure.
    async fn refresh(&self) -> Result<String, Error> {
        let mut state = self.state.lock().await;

        // Double-check: another caller may have refreshed while we
        // waited for the lock.
        let now = Instant::now();
        if let Some(proxy) = &state.current_proxy {
            if now < state.expire_at {
                return Ok(proxy.clone());
            }
        }

        let elapsed = now.duration_since(state.last_fetch_at);
        if elapsed < MIN_FETCH_GAP {
            tokio::time::sleep(MIN_FETCH_GAP - elapsed).await;
        }
        state.last_fetch_at = Instant::now();

        let mut last_err = None;
        for attempt in 0..MAX_FETCH_RETRIES {
            match api::fetch_proxies(&self.client, &self.api_url, 1).await {
                Ok(list) => {
                    if let Some(candidate) = list.into_iter().find(|p| !state.blocked.contains(p)) {
                        state.current_proxy = Some(candidate.clone());
                        state.expire_at = Instant::now() + self.refresh_interval;
                        state.total_fetched += 1;
                        tracing::info!(proxy = %candidate, "fetched new tps proxy");
                        return Ok(candidate);
                    }
                    last_err = Some(Error::NoProxyAvailable { channel: None });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "tps proxy fetch failed");
                    last_err = Some(e);
                }
            }
            if attempt + 1 < MAX_FETCH_RETRIES {
                tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
            }
        }

        state.total_errors += 1;
        if let Some(proxy) = state.current_proxy.clone() {
            // Fall back to the stale proxy per the original's behaviour:
            // "return old proxy (if any)" on fetch error.
            return Ok(proxy);
        }
        Err(last_err.unwrap_or(Error::NoProxyAvailable { channel: None }))
    }
}

#[async_trait]
impl ProxySource for TpsProxyManager {
    async fn get_proxy(&self, _channel: Option<u32>) -> Result<(String, Option<u32>), Error> {
        {
            let state = self.state.lock().await;
            if let Some(proxy) = &state.current_proxy {
                if Instant::now() < state.expire_at {
                    return Ok((proxy.clone(), None));
                }
            }
        }
        self.refresh().await.map(|p| (p, None))
    }

    async fn report_blocked(&self, _channel: Option<u32>) -> Result<(), Error> {
        let blocked = {
            let mut state = self.state.lock().await;
            let blocked = state.current_proxy.take();
            if let Some(proxy) = &blocked {
                if state.blocked.len() >= MAX_BLOCKLIST {
                    state.blocked.clear();
                }
                let _ = state.blocked.insert(proxy.clone());
            }
            state.expire_at = Instant::now();
            blocked
        };
        if let Some(proxy) = blocked {
            tracing::warn!(proxy = %proxy, "tps proxy reported blocked");
        }
        self.refresh().await.map(|_| ())
    }

    async fn stats(&self) -> ProxyStats {
        let state = self.state.lock().await;
        ProxyStats {
            total_fetched: state.total_fetched,
            total_errors: state.total_errors,
            blocked_count: state.blocked.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocklist_clears_in_bulk_at_cap() {
        let manager = TpsProxyManager::new(
            reqwest::Client::new(),
            "http://unused.invalid".to_string(),
            Duration::from_secs(60),
        );
        {
            let mut state = manager.state.lock().await;
            for i in 0..MAX_BLOCKLIST {
                let _ = state.blocked.insert(format!("http://1.1.1.{i}:80"));
            }
        }
        assert_eq!(manager.stats().await.blocked_count, MAX_BLOCKLIST);
        // Directly exercise the cap-then-clear behaviour `report_blocked`
        // applies, without depending on upstream network access.
        {
            let mut state = manager.state.lock().await;
            if state.blocked.len() >= MAX_BLOCKLIST {
                state.blocked.clear();
            }
            let _ = state.blocked.insert("http://9.9.9.9:80".to_string());
        }
        assert_eq!(manager.stats().await.blocked_count, 1);
    }
}
