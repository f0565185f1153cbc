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

//! Opaque HTTP session abstraction (§4.D). Out of scope for this
//! specification's core (session-cookie / anti-fingerprint handling is an
//! explicit Non-goal); what's in scope is the trait boundary the task
//! pipeline depends on, plus a minimal default implementation so the
//! pipeline's tests can exercise the boundary without a real session.

use async_trait::async_trait;

/// Errors a [`Fetch`] implementation can surface. The pipeline only
/// distinguishes timeout from other transport failures; everything else
/// is carried in [`FetchOutcome`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum FetchError {
    /// The request did not complete within the configured timeout.
    #[error("fetch timed out after {timeout_s}s")]
    Timeout {
        /// The timeout that was exceeded, in seconds.
        timeout_s: u64,
    },
    /// Any other transport-level failure (DNS, connect, TLS, proxy auth).
    #[error("fetch failed: {reason}")]
    Transport {
        /// Human-readable transport failure detail.
        reason: String,
    },
}

/// The result of a completed fetch. "Blocked" is a composite the Session
/// decides on its own (status code, anti-bot URL fragments, short-body
/// heuristics); the controller only ever sees this flag.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Response body size in bytes.
    pub bytes: u64,
    /// Whether this response was classified as anti-bot interference.
    pub blocked: bool,
    /// Whether this response was a 404 / equivalent "page gone" signal.
    pub not_found: bool,
}

/// The abstract surface the task pipeline depends on. `proxy` is a fully
/// qualified proxy URL as returned by `proxy::ProxySource::get_proxy`.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetches `url` through `proxy`, with the given extra headers.
    async fn fetch(
        &self,
        url: &str,
        proxy: &str,
        headers: &[(String, String)],
    ) -> Result<FetchOutcome, FetchError>;

    /// Forces the underlying session to rotate (TPS-mode blocked-handling,
    /// §4.F). A no-op for sessions with no persistent identity to rotate.
    async fn rotate(&self) {}
}

/// A `reqwest`-backed [`Fetch`] implementation applying the blocked-status
/// heuristic described in §4.D. Not part of the tested adaptive-control
/// core; wired in by the `worker` binary as the real collaborator.
pub struct ReqwestSession {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

impl ReqwestSession {
    /// Builds a session with the given per-request timeout (§5, default 15s).
    #[must_use]
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn classify_blocked(status: u16, body: &str) -> bool {
        matches!(status, 403 | 503) || body.contains("captcha") || body.len() < 64
    }
}

#[async_trait]
impl Fetch for ReqwestSession {
    async fn fetch(
        &self,
        url: &str,
        proxy: &str,
        headers: &[(String, String)],
    ) -> Result<FetchOutcome, FetchError> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy).map_err(|e| FetchError::Transport { reason: e.to_string() })?)
            .timeout(self.timeout)
            .build()
            .map_err(|e| FetchError::Transport { reason: e.to_string() })?;

        let mut request = client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    timeout_s: self.timeout.as_secs(),
                }
            } else {
                FetchError::Transport { reason: e.to_string() }
            }
        })?;

        let status = response.status().as_u16();
        let not_found = status == 404;
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport { reason: e.to_string() })?;
        let bytes = body.len() as u64;
        let blocked = Self::classify_blocked(status, &body);

        Ok(FetchOutcome {
            status,
            body,
            bytes,
            blocked,
            not_found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_anti_bot_status_codes_as_blocked() {
        assert!(ReqwestSession::classify_blocked(403, "hello world but not short at all"));
        assert!(ReqwestSession::classify_blocked(503, "hello world but not short at all"));
        assert!(!ReqwestSession::classify_blocked(200, "a perfectly normal and long enough product page body"));
    }

    #[test]
    fn classifies_short_bodies_as_blocked() {
        assert!(ReqwestSession::classify_blocked(200, "short"));
    }
}
