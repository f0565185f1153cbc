//! Versioned, validated runtime settings.
//!
//! Per-field ranges are declared with `validator`, matching the pattern
//! the base `config` crate uses for its pipeline configuration. Cross-field
//! constraints are not expressible with `validator`'s derive attributes, so
//! they're checked by hand in [`RuntimeSettings::validate_cross_fields`]
//! after per-field validation passes.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Proxy lifecycle mode, hot-swappable via a settings update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Fresh exit IP per request.
    Tps,
    /// N durable channels, rotated server-side on an interval.
    Tunnel,
}

/// Fleet-wide tunable parameters. The version is bumped on every
/// successful write; workers apply only strictly newer versions.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RuntimeSettings {
    /// Monotonic version, bumped on every accepted write.
    pub version: u64,

    /// Worker-local token bucket rate, requests/sec.
    #[validate(range(min = 0.5, max = 50.0))]
    pub token_bucket_rate: f64,

    /// AIMD starting concurrency target.
    #[validate(range(min = 1, max = 50))]
    pub initial_concurrency: u32,
    /// AIMD floor.
    #[validate(range(min = 1, max = 20))]
    pub min_concurrency: u32,
    /// AIMD ceiling (before any coordinator quota is applied).
    #[validate(range(min = 2, max = 100))]
    pub max_concurrency: u32,

    /// Seconds between AIMD evaluation ticks.
    #[validate(range(min = 3, max = 60))]
    pub adjust_interval_s: u32,
    /// p50 latency target for AIMD rule #5, seconds.
    #[validate(range(min = 1.0, max = 30.0))]
    pub target_latency_s: f64,
    /// p50 latency ceiling for AIMD rule #2, seconds.
    #[validate(range(min = 2.0, max = 60.0))]
    pub max_latency_s: f64,
    /// Success rate target for AIMD rule #5.
    #[validate(range(min = 0.5, max = 1.0))]
    pub target_success_rate: f64,
    /// Success rate floor for AIMD rule #2.
    #[validate(range(min = 0.3, max = 1.0))]
    pub min_success_rate: f64,
    /// Block rate above which AIMD rule #1 fires.
    #[validate(range(min = 0.01, max = 0.5))]
    pub block_rate_threshold: f64,
    /// Cooldown length after a block-triggered decrease, seconds.
    #[validate(range(min = 5, max = 120))]
    pub cooldown_after_block_s: u32,

    /// Fleet-wide concurrency budget.
    #[validate(range(min = 2, max = 500))]
    pub global_max_concurrency: u32,
    /// Fleet-wide QPS budget.
    #[validate(range(min = 0.5, max = 100.0))]
    pub global_max_qps: f64,

    /// Per-task retry ceiling.
    #[validate(range(min = 1, max = 10))]
    pub max_retries: u32,
    /// TPS-mode session rotation cadence, in requests.
    #[validate(range(min = 50, max = 10000))]
    pub session_rotate_every: u32,

    /// Active proxy lifecycle mode.
    pub proxy_mode: ProxyMode,
    /// Tunnel channel count (ignored in TPS mode).
    pub tunnel_channel_count: u32,
    /// Tunnel rotation interval, seconds (ignored in TPS mode).
    pub tunnel_rotation_interval_s: u64,
    /// Upstream proxy API base URL.
    pub proxy_api_url: String,
    /// Upstream proxy API URL for the authenticated (`ip:port:user:pwd`)
    /// response shape, when different from `proxy_api_url`.
    pub proxy_api_url_auth: Option<String>,
}

/// Settings validation failures, covering both per-field range checks and
/// the cross-field constraints `validator` cannot express declaratively.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum SettingsError {
    /// A field failed its declared range.
    #[error("field '{field}' out of range: {message}")]
    OutOfRange {
        /// The offending field name.
        field: String,
        /// Human-readable detail from the `validator` crate.
        message: String,
    },
    /// A cross-field invariant was violated.
    #[error("cross-field constraint violated: {0}")]
    CrossField(String),
}

impl RuntimeSettings {
    /// Validates per-field ranges, then cross-field constraints. Returns
    /// the first failure found; callers must roll back the whole update
    /// on any error and must not bump the version.
    pub fn validate_all(&self) -> Result<(), SettingsError> {
        self.validate().map_err(|errors| {
            let (field, messages) = errors
                .field_errors()
                .iter()
                .next()
                .map(|(f, e)| (f.to_string(), e.clone()))
                .unwrap_or_default();
            let message = messages
                .first()
                .and_then(|e| e.message.clone())
                .map(|m| m.to_string())
                .unwrap_or_else(|| "out of declared range".to_string());
            SettingsError::OutOfRange { field, message }
        })?;
        self.validate_cross_fields()
    }

    fn validate_cross_fields(&self) -> Result<(), SettingsError> {
        if !(self.min_concurrency <= self.initial_concurrency
            && self.initial_concurrency <= self.max_concurrency)
        {
            return Err(SettingsError::CrossField(format!(
                "min_concurrency ({}) <= initial_concurrency ({}) <= max_concurrency ({}) violated",
                self.min_concurrency, self.initial_concurrency, self.max_concurrency
            )));
        }
        if !(self.target_latency_s < self.max_latency_s) {
            return Err(SettingsError::CrossField(format!(
                "target_latency_s ({}) < max_latency_s ({}) violated",
                self.target_latency_s, self.max_latency_s
            )));
        }
        if !(self.min_success_rate <= self.target_success_rate) {
            return Err(SettingsError::CrossField(format!(
                "min_success_rate ({}) <= target_success_rate ({}) violated",
                self.min_success_rate, self.target_success_rate
            )));
        }
        Ok(())
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            version: 1,
            token_bucket_rate: 5.0,
            initial_concurrency: 8,
            min_concurrency: 2,
            max_concurrency: 40,
            adjust_interval_s: 10,
            target_latency_s: 2.0,
            max_latency_s: 8.0,
            target_success_rate: 0.95,
            min_success_rate: 0.85,
            block_rate_threshold: 0.05,
            cooldown_after_block_s: 30,
            global_max_concurrency: 30,
            global_max_qps: 6.0,
            max_retries: 3,
            session_rotate_every: 500,
            proxy_mode: ProxyMode::Tps,
            tunnel_channel_count: 3,
            tunnel_rotation_interval_s: 60,
            proxy_api_url: String::new(),
            proxy_api_url_auth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert!(RuntimeSettings::default().validate_all().is_ok());
    }

    #[test]
    fn rejects_min_above_initial() {
        let mut settings = RuntimeSettings::default();
        settings.min_concurrency = 20;
        settings.initial_concurrency = 8;
        assert!(matches!(
            settings.validate_all(),
            Err(SettingsError::CrossField(_))
        ));
    }

    #[test]
    fn rejects_target_latency_above_max_latency() {
        let mut settings = RuntimeSettings::default();
        settings.target_latency_s = 10.0;
        settings.max_latency_s = 8.0;
        assert!(matches!(
            settings.validate_all(),
            Err(SettingsError::CrossField(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_field() {
        let mut settings = RuntimeSettings::default();
        settings.token_bucket_rate = 1000.0;
        assert!(matches!(
            settings.validate_all(),
            Err(SettingsError::OutOfRange { .. })
        ));
    }
}
