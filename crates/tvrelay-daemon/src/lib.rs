//! tvrelay Daemon Library
//!
//! Core functionality for the relay daemon:
//! - Transcoder subprocess management
//! - Stream relay from transcoder output to HTTP clients
//! - Session registry for listing, stopping and draining live streams
//! - Upstream playlist/EPG fetching with caching
//! - axum HTTP server

pub mod relay;
pub mod server;
pub mod session;
pub mod subprocess;
pub mod upstream;
