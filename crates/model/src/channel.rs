//! Tunnel-mode proxy channels.

use serde::{Deserialize, Serialize};

/// One sub-tunnel in tunnel mode, identified by a small stable integer.
///
/// Created empty at startup, bound to a URL from the upstream proxy API,
/// and reset (not destroyed) on every rotation. Only worker shutdown
/// destroys it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Stable id in `1..=N`.
    pub id: u32,
    /// Currently bound proxy URL, empty until first assignment.
    pub proxy_url: String,
    /// Whether the channel was reported blocked since the last rotation.
    pub blocked: bool,
    /// Unix seconds the channel was marked blocked, if `blocked`.
    pub blocked_at: Option<u64>,
    /// Requests issued through this channel since the last rotation.
    pub requests_this_cycle: u64,
    /// Unix seconds of the last request issued through this channel.
    pub last_request_at: Option<u64>,
}

impl Channel {
    /// A freshly allocated, unbound channel.
    #[must_use]
    pub fn empty(id: u32) -> Self {
        Self {
            id,
            proxy_url: String::new(),
            blocked: false,
            blocked_at: None,
            requests_this_cycle: 0,
            last_request_at: None,
        }
    }

    /// Clears per-cycle state on rotation. The URL is overwritten by the
    /// caller separately once the refresh call returns.
    pub fn reset_cycle(&mut self) {
        self.blocked = false;
        self.blocked_at = None;
        self.requests_this_cycle = 0;
    }
}
