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

//! HTTP server exposing the coordinator's task, sync, settings, and
//! status surface (§6) over an [`Arbiter`].

pub mod error;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use coordinator_core::Arbiter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;

/// Shared state for every route handler.
#[derive(Clone)]
struct AppState {
    arbiter: Arc<Arbiter>,
}

/// Builds the router (exposed separately from [`run`] so tests can drive
/// it in-process without binding a socket).
fn app(arbiter: Arc<Arbiter>) -> Router {
    Router::new()
        .merge(routes::tasks::routes())
        .merge(routes::sync::routes())
        .merge(routes::settings::routes())
        .merge(routes::status::routes())
        .merge(routes::health::routes())
        .with_state(AppState { arbiter })
}

/// Serves the coordinator's HTTP API on `bind_address` until `cancel` is
/// triggered.
pub async fn run(bind_address: &str, arbiter: Arc<Arbiter>, cancel: CancellationToken) -> Result<(), Error> {
    let addr = bind_address
        .parse::<SocketAddr>()
        .map_err(|e| Error::InvalidBindAddress { bind_address: bind_address.to_string(), details: e.to_string() })?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::BindFailed { addr: addr.to_string(), details: e.to_string() })?;

    info!(%addr, "coordinator API listening");

    axum::serve(listener, app(arbiter))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::ServerError { addr: addr.to_string(), details: e.to_string() })
}
