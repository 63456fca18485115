//! Logging and tracing initialization.
//!
//! Call one of these once at startup, before building the server. The log
//! level is controlled by `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug cargo run          # request traces included
//! RUST_LOG=warn cargo run           # production
//! RUST_LOG=sirocco_core=debug cargo run
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults (`info` unless `RUST_LOG` is
/// set).
///
/// # Panics
///
/// Panics if a global subscriber was already installed. Call it once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging with an explicit level instead of `RUST_LOG`.
///
/// # Panics
///
/// Panics if a global subscriber was already installed. Call it once.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// JSON-formatted logging for log aggregation systems.
///
/// # Panics
///
/// Panics if a global subscriber was already installed. Call it once.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
