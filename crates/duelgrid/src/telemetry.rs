//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. `RUST_LOG` controls the
/// filter and defaults to `info`. Call once, before starting any
/// instance; a second call panics.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
