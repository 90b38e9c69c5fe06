//! crates/logging/src/lib.rs
//!
//! One-call logging bootstrap for the firehose binaries.
//!
//! Workers log through the [`tracing`] facade; this crate owns the
//! subscriber so both binaries format events the same way. `RUST_LOG`
//! overrides the verbosity-derived default filter.

use tracing_subscriber::EnvFilter;

/// Default filter directive for a given `-v` count.
#[must_use]
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber.
///
/// Safe to call more than once; only the first call takes effect (useful
/// under test harnesses that initialize per-test).
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}
