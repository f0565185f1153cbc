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

//! The coordinator's in-process core: worker registry, quota allocation,
//! the global-block FSM, settings storage, and the task backlog, tied
//! together by [`Arbiter`].
//!
//! This crate has no HTTP surface of its own; `coordinator-api` wraps an
//! [`Arbiter`] behind `axum` routes.

pub mod arbiter;
pub mod block;
pub mod quota;
pub mod registry;
pub mod settings;
pub mod tasks;

pub use arbiter::Arbiter;
pub use tasks::{InMemoryTaskStore, TaskStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix seconds. The only place this crate
/// reads the system clock; every other function takes `now` explicitly
/// so the allocation and FSM logic stays deterministic under test.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
