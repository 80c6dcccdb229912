//! Logging setup for the `tvrelay` binaries.
//!
//! Session lifecycle events (start, end, stop requests, transcoder failures)
//! are logged at `info`/`warn` under `tvrelay_daemon`. Transcoder stderr lines
//! and per-request HTTP spans from `tower_http` only show up at `debug`.
//! `RUST_LOG`, when set, replaces the configured filter entirely.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber, writing to stderr.
///
/// `log_json` switches to one JSON object per line for log collectors.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    if log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Filter directive applying `level` to the given binary crate, the core
/// library and HTTP request tracing.
///
/// `("tvrelay_daemon", "debug")` → `"tvrelay_daemon=debug,tvrelay_core=debug,tower_http=debug"`.
pub fn default_filter(crate_name: &str, level: &str) -> String {
    format!("{crate_name}={level},tvrelay_core={level},tower_http={level}")
}
