//! Session registry with capacity limit and cooperative stop signals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{SessionError, SessionInfo, SessionState};

struct SessionEntry {
    label: String,
    state: SessionState,
    pid: Option<u32>,
    bytes_sent: Arc<AtomicU64>,
    started: Instant,
    stop_tx: watch::Sender<bool>,
}

struct Inner {
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    /// Number of registered sessions, for shutdown draining.
    active: watch::Sender<usize>,
    max_sessions: usize,
}

impl Inner {
    // Entries are plain data, so a poisoned lock is still usable.
    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks in-flight relay sessions.
///
/// Cloning is cheap and every clone sees the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                active,
                max_sessions,
            }),
        }
    }

    /// Register a new session in the `Starting` state.
    ///
    /// The entry lives exactly as long as the returned ticket.
    #[allow(clippy::significant_drop_tightening)]
    pub fn register(&self, label: impl Into<String>) -> Result<SessionTicket, SessionError> {
        let label = label.into();
        let id = Uuid::new_v4();
        let (stop_tx, stop_rx) = watch::channel(false);
        let bytes_sent = Arc::new(AtomicU64::new(0));

        let mut sessions = self.inner.sessions();
        if sessions.len() >= self.inner.max_sessions {
            return Err(SessionError::CapacityExhausted {
                current: sessions.len(),
                max: self.inner.max_sessions,
            });
        }
        sessions.insert(
            id,
            SessionEntry {
                label: label.clone(),
                state: SessionState::Starting,
                pid: None,
                bytes_sent: Arc::clone(&bytes_sent),
                started: Instant::now(),
                stop_tx,
            },
        );
        self.inner.active.send_replace(sessions.len());
        drop(sessions);

        info!(session_id = %id, label = %label, "Session registered");
        Ok(SessionTicket {
            id,
            inner: Arc::clone(&self.inner),
            bytes_sent,
            stop_rx,
        })
    }

    /// Snapshot of all live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut entries: Vec<(Instant, SessionInfo)> = self
            .inner
            .sessions()
            .iter()
            .map(|(id, entry)| {
                (
                    entry.started,
                    SessionInfo {
                        id: *id,
                        label: entry.label.clone(),
                        state: entry.state,
                        pid: entry.pid,
                        bytes_sent: entry.bytes_sent.load(Ordering::Relaxed),
                        age_secs: now.duration_since(entry.started).as_secs(),
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(started, _)| *started);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    /// Ask one session to stop. The session tears itself down.
    pub fn stop(&self, id: Uuid) -> Result<(), SessionError> {
        let sessions = self.inner.sessions();
        let entry = sessions.get(&id).ok_or(SessionError::NotFound { id })?;
        entry.stop_tx.send_replace(true);
        drop(sessions);
        info!(session_id = %id, "Stop requested");
        Ok(())
    }

    /// Ask every session to stop. Returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let sessions = self.inner.sessions();
        for entry in sessions.values() {
            entry.stop_tx.send_replace(true);
        }
        let count = sessions.len();
        drop(sessions);
        if count > 0 {
            info!(count, "Stop requested for all sessions");
        }
        count
    }

    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Wait until no sessions are registered. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.active.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        )
    }
}

/// Membership of one session in the registry.
///
/// Dropping the ticket removes the session.
pub struct SessionTicket {
    id: Uuid,
    inner: Arc<Inner>,
    bytes_sent: Arc<AtomicU64>,
    stop_rx: watch::Receiver<bool>,
}

impl SessionTicket {
    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn set_state(&self, state: SessionState) {
        if let Some(entry) = self.inner.sessions().get_mut(&self.id) {
            entry.state = state;
        }
        debug!(session_id = %self.id, %state, "Session state changed");
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        if let Some(entry) = self.inner.sessions().get_mut(&self.id) {
            entry.pid = pid;
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Resolves once a stop has been requested for this session.
    pub async fn stopped(&self) {
        let mut rx = self.stop_rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            // Sender lives in the registry entry, which outlives the ticket.
            std::future::pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTicket")
            .field("id", &self.id)
            .field("bytes_sent", &self.bytes_sent())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        let mut sessions = self.inner.sessions();
        let removed = sessions.remove(&self.id);
        self.inner.active.send_replace(sessions.len());
        drop(sessions);
        if let Some(entry) = removed {
            debug!(
                session_id = %self.id,
                label = %entry.label,
                state = %entry.state,
                bytes = self.bytes_sent(),
                "Session removed"
            );
        }
    }
}
