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

//! Dual-mode (TPS / tunnel) proxy provider (§4.C).
//!
//! Both modes share one [`ProxySource`] trait so the task pipeline can be
//! written once against an abstract acquire/report-blocked surface, the
//! way the base's `ReceiverFactory`/`ProcessorFactory`/`ExporterFactory`
//! traits let the engine stay mode-agnostic over concrete implementations.

pub mod api;
pub mod dynamic;
pub mod tps;
pub mod tunnel;

use async_trait::async_trait;

pub use dynamic::DynamicProxySource;
pub use tps::TpsProxyManager;
pub use tunnel::TunnelProxyManager;

/// Errors that can occur while acquiring or reporting on a proxy.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The upstream proxy API request failed at the transport layer.
    #[error("upstream proxy API request failed: {reason}")]
    UpstreamRequest {
        /// Human-readable transport failure detail.
        reason: String,
    },
    /// The upstream proxy API responded with a non-zero status code.
    #[error("upstream proxy API returned error code {code}")]
    UpstreamApi {
        /// The API's own error code.
        code: i64,
    },
    /// No proxy is currently available and none could be obtained.
    #[error("no proxy available (channel: {channel:?})")]
    NoProxyAvailable {
        /// The channel requested, if tunnel mode.
        channel: Option<u32>,
    },
}

/// Current proxy statistics, surfaced for observability.
#[derive(Debug, Clone, Default)]
pub struct ProxyStats {
    /// Total proxies successfully fetched from upstream.
    pub total_fetched: u64,
    /// Total upstream fetch errors.
    pub total_errors: u64,
    /// Number of proxies/channels currently marked blocked.
    pub blocked_count: usize,
}

/// The uniform surface the task pipeline depends on, regardless of mode.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Returns a usable proxy URL and, in tunnel mode, the channel id it
    /// was drawn from (`None` in TPS mode).
    async fn get_proxy(&self, channel: Option<u32>) -> Result<(String, Option<u32>), Error>;

    /// Reports that the given proxy (or channel) was detected blocked.
    /// TPS mode invalidates its single cached proxy; tunnel mode marks
    /// the specific channel.
    async fn report_blocked(&self, channel: Option<u32>) -> Result<(), Error>;

    /// Current statistics, for the coordinator-facing observability
    /// endpoint and for tests.
    async fn stats(&self) -> ProxyStats;
}

/// Mode-dispatching proxy manager. The pipeline holds one of these behind
/// an `Arc` and never needs to know which mode is active except when
/// driving the tunnel-only rotation loop.
pub enum ProxyManager {
    /// Per-request fresh-IP mode.
    Tps(TpsProxyManager),
    /// N-channel, periodically-rotated mode.
    Tunnel(TunnelProxyManager),
}

#[async_trait]
impl ProxySource for ProxyManager {
    async fn get_proxy(&self, channel: Option<u32>) -> Result<(String, Option<u32>), Error> {
        match self {
            ProxyManager::Tps(m) => m.get_proxy(channel).await,
            ProxyManager::Tunnel(m) => m.get_proxy(channel).await,
        }
    }

    async fn report_blocked(&self, channel: Option<u32>) -> Result<(), Error> {
        match self {
            ProxyManager::Tps(m) => m.report_blocked(channel).await,
            ProxyManager::Tunnel(m) => m.report_blocked(channel).await,
        }
    }

    async fn stats(&self) -> ProxyStats {
        match self {
            ProxyManager::Tps(m) => m.stats().await,
            ProxyManager::Tunnel(m) => m.stats().await,
        }
    }
}

impl ProxyManager {
    /// Returns the tunnel manager if this is a tunnel-mode instance, for
    /// driving `wait_for_rotation`/`handle_ip_rotation` from the worker's
    /// background rotation task.
    #[must_use]
    pub fn as_tunnel(&self) -> Option<&TunnelProxyManager> {
        match self {
            ProxyManager::Tunnel(m) => Some(m),
            ProxyManager::Tps(_) => None,
        }
    }
}
