//! Session registry types.

use serde::Serialize;
use uuid::Uuid;

/// Lifecycle state of a relay session.
///
/// `starting → streaming → {completed | client_disconnected | process_failed | terminated}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Streaming,
    Completed,
    ClientDisconnected,
    ProcessFailed,
    Terminated,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::ClientDisconnected => "client_disconnected",
            Self::ProcessFailed => "process_failed",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    /// What is being streamed (`channel:X`, `url:...`, `default`).
    pub label: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub bytes_sent: u64,
    pub age_secs: u64,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session limit reached ({current}/{max})")]
    CapacityExhausted { current: usize, max: usize },

    #[error("Session not found: {id}")]
    NotFound { id: Uuid },
}
