//! Small helpers shared across the crate.

/// Installs a global `tracing` subscriber reading its filter from the
/// `RUST_LOG` environment variable. Call at most once, early in the
/// host program; library code only ever emits events.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
