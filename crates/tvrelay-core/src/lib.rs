//! `tvrelay` Core Library
//!
//! Shared functionality for the relay daemon:
//! - Configuration loading and resolution
//! - Transcode profiles and upstream resolution
//! - M3U playlist parsing and filtering
//! - Common error types

pub mod config;
pub mod error;
pub mod playlist;
pub mod profile;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use profile::{RelayRequest, ResolutionError, Resolver, TranscodeProfile, UpstreamHeaders};
