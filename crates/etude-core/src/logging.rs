//! Logging initialization.
//!
//! The level is taken from `RUST_LOG` when set:
//!
//! ```bash
//! RUST_LOG=debug etude 8080          # per-request traces
//! RUST_LOG=etude_core=trace etude 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber at `info`, unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Install the global subscriber with `level` as the fallback filter.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}
