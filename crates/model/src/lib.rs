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

//! Shared data model for the scraping fleet's coordinator and workers.
//!
//! None of the types here embed behaviour beyond small derived accessors;
//! the state machines that mutate them live in the `aimd`, `pipeline`,
//! `proxy` and `coordinator-core` crates.

pub mod channel;
pub mod outcome;
pub mod quota;
pub mod settings;
pub mod task;
pub mod wire;
pub mod worker;

pub use channel::Channel;
pub use outcome::{MetricsSnapshot, RequestOutcome};
pub use quota::{GlobalBlockDescriptor, GlobalBlockState, Quota};
pub use settings::{ProxyMode, RuntimeSettings, SettingsError};
pub use task::{Task, TaskState};
pub use worker::WorkerRegistration;
