//! Transcoder subprocess management.

pub mod runner;

pub use runner::{ProcessHandle, ProcessRunner, SubprocessError};
