//! Builds a fresh `proxy::ProxyManager` from settings, so a mode-switch
//! settings delta (§4.H step 1) can reinitialise the proxy manager
//! without `worker-sync` itself depending on `reqwest` construction
//! details or tunnel channel bootstrap.

use async_trait::async_trait;
use model::RuntimeSettings;
use proxy::ProxyManager;

/// Builds a [`ProxyManager`] matching the active `proxy_mode` and its
/// mode-specific settings.
#[async_trait]
pub trait ProxyManagerFactory: Send + Sync {
    /// Constructs a manager for `settings.proxy_mode`.
    async fn build(&self, settings: &RuntimeSettings) -> ProxyManager;
}
