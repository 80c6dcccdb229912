//! `tvrelay` Daemon
//!
//! Serves a filtered IPTV playlist and EPG, and relays live channels through
//! an external transcoder to HTTP clients.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use tvrelay_core::config::load_config;
use tvrelay_core::tracing_init::{default_filter, init_tracing};
use tvrelay_daemon::relay::StreamRelay;
use tvrelay_daemon::server::{AppState, build_router};
use tvrelay_daemon::session::SessionRegistry;
use tvrelay_daemon::upstream::UpstreamClient;

/// Extra time on top of the terminate timeout for sessions to drain.
const DRAIN_SLACK: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "tvrelay-daemon")]
#[command(version, about = "tvrelay daemon - IPTV playlist filter and stream relay")]
struct Args {
    /// Config file path (default: ~/.config/tvrelay/config.toml)
    #[arg(long, env = "TVRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides `server.listen`)
    #[arg(long, env = "TVRELAY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Transcoder executable (overrides `transcode.program`)
    #[arg(long)]
    transcoder: Option<String>,

    /// Maximum concurrent relay sessions (overrides `transcode.max_sessions`)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TVRELAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    if let Some(program) = args.transcoder {
        config.transcode.program = program;
    }
    if let Some(max) = args.max_sessions {
        config.transcode.max_sessions = max;
    }
    config.validate()?;

    init_tracing(
        &default_filter("tvrelay_daemon", &config.server.log_level),
        args.log_json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen,
        transcoder = %config.transcode.program,
        max_sessions = config.transcode.max_sessions,
        "Starting tvrelay-daemon"
    );

    let registry = SessionRegistry::new(config.transcode.max_sessions);
    let relay = Arc::new(StreamRelay::from_config(&config, registry.clone())?);
    let upstream = Arc::new(UpstreamClient::new(&config)?);
    let app = build_router(AppState::new(&config, relay, upstream));

    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so transcoder processes
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %config.server.listen, "HTTP server ready");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let stopping = registry.stop_all();
    if stopping > 0 {
        let drain = config.transcode.terminate_timeout() + DRAIN_SLACK;
        if registry.wait_idle(drain).await {
            info!(sessions = stopping, "All relay sessions stopped");
        } else {
            warn!(
                remaining = registry.active_count(),
                "Relay sessions still running after shutdown timeout"
            );
        }
    }

    info!("Daemon stopped");
    Ok(())
}
