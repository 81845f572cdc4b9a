//! `tracing` subscriber setup.
//!
//! Both initializers ignore the error returned when a global subscriber is
//! already installed, so they are safe to call from tests.

use crate::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Stderr logging filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_minimal() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Stderr logging at the configured level. `RUST_LOG` still wins when set.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_ascii_lowercase()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
