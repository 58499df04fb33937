//! Tracing setup for the daemon binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging with human-readable output.
///
/// Uses `RUST_LOG` when set, otherwise `default_level`. Safe to call more
/// than once (e.g. in tests) — later calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised");
}
