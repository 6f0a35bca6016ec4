//! Tracing setup shared by the CLI and the daemon.
//!
//! Output goes to stderr in compact format. `RUST_LOG` takes precedence over
//! the default directive passed by the binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// # Example
/// ```bash
/// RUST_LOG=reconcile=debug reconciled --config ./config.toml
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
