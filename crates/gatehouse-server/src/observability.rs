// Tracing initialization.
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber at `level`. `RUST_LOG`, when set and
/// parseable, takes precedence.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
