//! Tracing subscriber initialization.

use tracing_subscriber::EnvFilter;

/// Initialize console tracing. The config level is the default;
/// `RUST_LOG` overrides it.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
