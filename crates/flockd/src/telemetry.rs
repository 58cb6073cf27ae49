//! Tracing initialization for the flock daemon.
//!
//! Human-readable logs to stdout, filtered by `RUST_LOG` when set and by the
//! configured level otherwise.

use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber.
///
/// Call this once at startup, before any `tracing` events are emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}
