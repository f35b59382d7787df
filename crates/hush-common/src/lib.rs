//! Shared utilities for Hush: wire protocol, logging, error types.
//!
//! This crate provides common infrastructure used by both the relay and the client.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing with a specific default level.
///
/// `RUST_LOG`, when set, takes precedence over `default_level`.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Current wall-clock time as unix milliseconds, used for chat timestamps.
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
