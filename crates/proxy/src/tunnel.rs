//! Tunnel (N-channel, server-side-rotated) proxy mode.
//!
//! This mode has no counterpart in the original Python implementation
//! (it only ever ran TPS-mode); it is built purely from §4.C's
//! description, following the TPS manager's shape where the two overlap
//! (single-flight-style locking, the same upstream API client) and the
//! base's mode-over-a-common-trait dispatch pattern for everything else.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use model::Channel;
use tokio::sync::{Mutex, Notify};

use crate::{api, Error, ProxySource, ProxyStats};

struct State {
    channels: Vec<Channel>,
    round_robin: usize,
    last_rotation: Instant,
    total_fetched: u64,
    total_errors: u64,
}

/// Tunnel-mode proxy manager: N pre-allocated channels, round-robin over
/// the non-blocked ones, periodic server-side rotation.
pub struct TunnelProxyManager {
    client: reqwest::Client,
    api_url: String,
    channel_count: u32,
    rotation_interval: Duration,
    state: Mutex<State>,
    rotated: Notify,
}

impl TunnelProxyManager {
    /// Creates a manager with `channel_count` empty channels. Call
    /// [`Self::init_channels`] before serving traffic.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        channel_count: u32,
        rotation_interval: Duration,
    ) -> Self {
        let channels = (1..=channel_count).map(Channel::empty).collect();
        Self {
            client,
            api_url,
            channel_count,
            rotation_interval,
            state: Mutex::new(State {
                channels,
                round_robin: 0,
                last_rotation: Instant::now(),
                total_fetched: 0,
                total_errors: 0,
            }),
            rotated: Notify::new(),
        }
    }

    /// Fetches `channel_count` proxy URLs from the upstream API in one
    /// call and binds them to channel ids `1..=N`, clearing blocked
    /// flags. Used both at startup and by `handle_ip_rotation`.
    pub async fn init_channels(&self) -> Result<(), Error> {
        self.refresh_channels().await
    }

    async fn refresh_channels(&self) -> Result<(), Error> {
        let urls = match api::fetch_proxies(&self.client, &self.api_url, self.channel_count).await {
            Ok(urls) => urls,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.total_errors += 1;
                tracing::warn!(error = %e, "tunnel proxy refresh failed, keeping stale urls");
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        for (channel, url) in state.channels.iter_mut().zip(urls.into_iter()) {
            channel.reset_cycle();
            channel.proxy_url = url;
        }
        state.total_fetched += 1;
        Ok(())
    }

    /// Blocks until the next rotation deadline passes. Callers racing
    /// with `handle_ip_rotation` are woken once it actually rotates.
    pub async fn wait_for_rotation(&self) {
        self.rotated.notified().await;
    }

    /// If the rotation deadline has passed, clears all blocked flags and
    /// refreshes every channel's URL in one upstream call, then returns
    /// `true`. Otherwise returns `false` without side effects.
    pub async fn handle_ip_rotation(&self) -> bool {
        let due = {
            let state = self.state.lock().await;
            Instant::now() >= state.last_rotation + self.rotation_interval
        };
        if !due {
            return false;
        }
        if self.refresh_channels().await.is_ok() {
            let mut state = self.state.lock().await;
            state.last_rotation = Instant::now();
            drop(state);
            self.rotated.notify_waiters();
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ProxySource for TunnelProxyManager {
    async fn get_proxy(&self, channel: Option<u32>) -> Result<(String, Option<u32>), Error> {
        if let Some(id) = channel {
            let state = self.state.lock().await;
            return state
                .channels
                .iter()
                .find(|c| c.id == id)
                .map(|c| (c.proxy_url.clone(), Some(c.id)))
                .ok_or(Error::NoProxyAvailable { channel: Some(id) });
        }

        loop {
            {
                let mut state = self.state.lock().await;
                let available: Vec<usize> = state
                    .channels
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.blocked)
                    .map(|(i, _)| i)
                    .collect();
                if !available.is_empty() {
                    let pick = state.round_robin % available.len();
                    let idx = available[pick];
                    state.round_robin = state.round_robin.wrapping_add(1);
                    let chosen = &state.channels[idx];
                    return Ok((chosen.proxy_url.clone(), Some(chosen.id)));
                }
            }
            // All channels blocked: suspend until a rotation clears them.
            self.wait_for_rotation().await;
        }
    }

    async fn report_blocked(&self, channel: Option<u32>) -> Result<(), Error> {
        let Some(id) = channel else {
            tracing::warn!("report_blocked called without a channel id in tunnel mode");
            return Ok(());
        };
        let mut state = self.state.lock().await;
        if let Some(c) = state.channels.iter_mut().find(|c| c.id == id) {
            c.blocked = true;
            c.blocked_at = Some(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            );
            tracing::warn!(channel = id, "tunnel channel reported blocked");
        }
        Ok(())
    }

    async fn stats(&self) -> ProxyStats {
        let state = self.state.lock().await;
        ProxyStats {
            total_fetched: state.total_fetched,
            total_errors: state.total_errors,
            blocked_count: state.channels.iter().filter(|c| c.blocked).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_urls(n: u32) -> TunnelProxyManager {
        TunnelProxyManager::new(
            reqwest::Client::new(),
            "http://unused.invalid".to_string(),
            n,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn round_robin_skips_blocked_channels() {
        let manager = manager_with_urls(3);
        {
            let mut state = manager.state.lock().await;
            for c in state.channels.iter_mut() {
                c.proxy_url = format!("http://proxy-{}", c.id);
            }
        }
        manager.report_blocked(Some(2)).await.unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            let (_, channel) = manager.get_proxy(None).await.unwrap();
            seen.insert(channel.unwrap());
        }
        assert!(!seen.contains(&2));
        assert!(seen.contains(&1) && seen.contains(&3));
    }

    #[tokio::test]
    async fn explicit_channel_bypasses_round_robin() {
        let manager = manager_with_urls(2);
        {
            let mut state = manager.state.lock().await;
            state.channels[0].proxy_url = "http://proxy-1".to_string();
        }
        let (url, id) = manager.get_proxy(Some(1)).await.unwrap();
        assert_eq!(url, "http://proxy-1");
        assert_eq!(id, Some(1));
    }

    #[tokio::test]
    async fn all_channels_blocked_suspends_until_rotation() {
        let manager = std::sync::Arc::new(manager_with_urls(2));
        manager.report_blocked(Some(1)).await.unwrap();
        manager.report_blocked(Some(2)).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_proxy(None).await })
        };

        // Give the waiter a moment to block on wait_for_rotation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Simulate a rotation directly (bypassing the real upstream call)
        // by clearing flags and notifying waiters, mirroring what
        // handle_ip_rotation does after a successful refresh.
        {
            let mut state = manager.state.lock().await;
            for c in state.channels.iter_mut() {
                c.blocked = false;
                c.proxy_url = format!("http://proxy-{}", c.id);
            }
            state.last_rotation = Instant::now();
        }
        manager.rotated.notify_waiters();

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }
}
