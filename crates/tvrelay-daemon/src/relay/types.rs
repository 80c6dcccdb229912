//! Relay module types.

use std::process::ExitStatus;

use uuid::Uuid;

use tvrelay_core::ResolutionError;

use crate::session::{SessionError, SessionState};
use crate::subprocess::SubprocessError;

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The transcoder closed its output.
    Completed,
    /// The client stopped accepting data.
    ClientDisconnected,
    /// Reading transcoder output failed.
    ProcessFailed,
    /// Stopped through the registry (admin request or shutdown).
    Terminated,
}

impl From<SessionEnd> for SessionState {
    fn from(end: SessionEnd) -> Self {
        match end {
            SessionEnd::Completed => Self::Completed,
            SessionEnd::ClientDisconnected => Self::ClientDisconnected,
            SessionEnd::ProcessFailed => Self::ProcessFailed,
            SessionEnd::Terminated => Self::Terminated,
        }
    }
}

/// Result of a session that got as far as streaming.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub session_id: Uuid,
    pub end: SessionEnd,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    /// Exit status of the reaped transcoder. `None` if it could not be reaped.
    pub exit: Option<ExitStatus>,
}

impl RelayOutcome {
    pub fn is_clean_end(&self) -> bool {
        self.end == SessionEnd::Completed
    }
}

/// Errors that prevent a session from streaming.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Cannot resolve upstream: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Failed to launch transcoder: {0}")]
    Launch(#[from] SubprocessError),

    #[error("Transcoder exited without producing output ({})", describe_exit(.exit.as_ref()))]
    StreamFailure {
        exit: Option<ExitStatus>,
        /// Last stderr lines of the transcoder.
        stderr: Vec<String>,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Session stopped before streaming started")]
    Cancelled,
}

fn describe_exit(exit: Option<&ExitStatus>) -> String {
    exit.map_or_else(|| "status unknown".to_string(), ToString::to_string)
}
