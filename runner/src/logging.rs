//! Stderr tracing setup.
//!
//! Tracing here is diagnostics only. Everything worth keeping about a run
//! lands in `metrics.db` and the `results/` artifacts no matter what filter
//! is active, so this subscriber can stay quiet by default: `warn` unless
//! `--debug` was passed, with `RUST_LOG` taking precedence over both.

use tracing_subscriber::EnvFilter;

/// Install the global stderr subscriber for this process.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
