//! Stream relay pipeline: transcoder stdout → client sink.
//!
//! A session is opened in two steps so HTTP callers can pick a status code
//! before committing to a streaming body:
//!
//! 1. [`StreamRelay::open`] resolves the request, registers the session,
//!    spawns the transcoder and waits for its first chunk. A transcoder that
//!    fails before producing anything is reported as
//!    [`RelayError::StreamFailure`]. [`StreamRelay::relay`] already holds the
//!    sink at this point and also gives up as soon as it closes.
//! 2. [`RelaySession::pump`] copies chunks to the sink until end of stream,
//!    client disconnect, read failure, or a stop request, then terminates
//!    the transcoder.
//!
//! The session owns its [`ProcessHandle`]. If the session is dropped without
//! being pumped to completion, `kill_on_drop` still kills the process and
//! dropping the ticket removes it from the registry.

use std::future::{self, Future};
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use bytes::Bytes;
use tokio::process::ChildStdout;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tvrelay_core::{Config, RelayRequest, Resolver};

use crate::session::{SessionRegistry, SessionState, SessionTicket};
use crate::subprocess::{ProcessHandle, ProcessRunner, SubprocessError};

use super::sink::RelaySink;
use super::types::{RelayError, RelayOutcome, SessionEnd};

/// How long a transcoder gets to exit on its own after closing stdout.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Starts relay sessions. Shared by all request handlers.
#[derive(Clone)]
pub struct StreamRelay {
    resolver: Resolver,
    runner: ProcessRunner,
    registry: SessionRegistry,
    chunk_size: usize,
}

impl StreamRelay {
    pub const fn new(
        resolver: Resolver,
        runner: ProcessRunner,
        registry: SessionRegistry,
        chunk_size: usize,
    ) -> Self {
        Self {
            resolver,
            runner,
            registry,
            chunk_size,
        }
    }

    /// Build a relay from the loaded configuration.
    pub fn from_config(config: &Config, registry: SessionRegistry) -> tvrelay_core::Result<Self> {
        Ok(Self::new(
            Resolver::from_config(config)?,
            ProcessRunner::new(config.transcode.terminate_timeout()),
            registry,
            config.transcode.chunk_size,
        ))
    }

    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub const fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Run one session end to end.
    ///
    /// A sink that closes while the transcoder has not produced anything yet
    /// ends the session as [`SessionEnd::ClientDisconnected`].
    pub async fn relay<S: RelaySink>(
        &self,
        request: &RelayRequest,
        sink: S,
    ) -> Result<RelayOutcome, RelayError> {
        let opened = self.start(request, sink.closed()).await?;
        match opened {
            Opened::Ready(session) => Ok(session.pump(sink).await),
            Opened::ClientGone(outcome) => Ok(outcome),
        }
    }

    /// Start a session and wait for the transcoder's first chunk.
    ///
    /// A transcoder that exits successfully without output yields a session
    /// that completes immediately with an empty body.
    pub async fn open(&self, request: &RelayRequest) -> Result<RelaySession, RelayError> {
        match self.start(request, future::pending::<()>()).await? {
            Opened::Ready(session) => Ok(session),
            // `pending` never resolves.
            Opened::ClientGone(_) => Err(RelayError::Cancelled),
        }
    }

    async fn start(
        &self,
        request: &RelayRequest,
        client_gone: impl Future<Output = ()>,
    ) -> Result<Opened, RelayError> {
        let argv = self.resolver.render(request)?;
        let ticket = self.registry.register(request.label())?;
        let session_id = ticket.id();

        let mut process = match self.runner.start(&argv) {
            Ok(process) => process,
            Err(e) => {
                warn!(%session_id, error = %e, "Transcoder launch failed");
                ticket.set_state(SessionState::ProcessFailed);
                return Err(e.into());
            }
        };
        ticket.set_pid(process.pid());

        let Some(stdout) = process.take_stdout() else {
            process.terminate().await;
            ticket.set_state(SessionState::ProcessFailed);
            return Err(SubprocessError::Pipe {
                program: argv.first().cloned().unwrap_or_default(),
                stream: "stdout",
            }
            .into());
        };
        let mut chunks = ReaderStream::with_capacity(stdout, self.chunk_size);

        let first = tokio::select! {
            biased;
            () = ticket.stopped() => {
                process.terminate().await;
                ticket.set_state(SessionState::Terminated);
                info!(%session_id, "Session stopped before first chunk");
                return Err(RelayError::Cancelled);
            }
            () = client_gone => {
                let exit = process.terminate().await;
                ticket.set_state(SessionState::ClientDisconnected);
                info!(%session_id, "Client went away before first chunk");
                return Ok(Opened::ClientGone(RelayOutcome {
                    session_id,
                    end: SessionEnd::ClientDisconnected,
                    bytes_sent: 0,
                    chunks_sent: 0,
                    exit,
                }));
            }
            item = chunks.next() => item,
        };

        let pending = match first {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(e)) => {
                warn!(%session_id, error = %e, "Reading transcoder output failed");
                return Err(fail_before_output(&ticket, &mut process).await);
            }
            None => {
                let status = finish(&mut process).await;
                if !status.is_some_and(|s| s.success()) {
                    return Err(fail_before_output(&ticket, &mut process).await);
                }
                debug!(%session_id, "Transcoder finished cleanly without output");
                None
            }
        };

        info!(%session_id, pid = process.pid(), label = %request.label(), "Relay session started");
        Ok(Opened::Ready(RelaySession {
            ticket,
            process,
            chunks,
            pending,
        }))
    }
}

enum Opened {
    Ready(RelaySession),
    ClientGone(RelayOutcome),
}

/// An opened session, ready to stream.
pub struct RelaySession {
    ticket: SessionTicket,
    process: ProcessHandle,
    chunks: ReaderStream<ChildStdout>,
    /// Chunk read while opening, delivered first.
    pending: Option<Bytes>,
}

/// How the copy loop exited.
enum LoopExit {
    EndOfStream,
    ReadError(io::Error),
    ClientGone,
    Stopped,
}

impl RelaySession {
    pub const fn id(&self) -> Uuid {
        self.ticket.id()
    }

    pub const fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Copy transcoder output into `sink` until the session ends, then
    /// terminate and reap the transcoder.
    pub async fn pump<S: RelaySink>(mut self, mut sink: S) -> RelayOutcome {
        let session_id = self.ticket.id();
        self.ticket.set_state(SessionState::Streaming);

        let mut chunks_sent = 0u64;
        let exit = loop {
            let chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => {
                    let next = tokio::select! {
                        biased;
                        () = self.ticket.stopped() => break LoopExit::Stopped,
                        () = sink.closed() => break LoopExit::ClientGone,
                        next = self.chunks.next() => next,
                    };
                    match next {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => break LoopExit::ReadError(e),
                        None => break LoopExit::EndOfStream,
                    }
                }
            };

            let len = chunk.len() as u64;
            let sent = tokio::select! {
                biased;
                () = self.ticket.stopped() => break LoopExit::Stopped,
                sent = sink.send(chunk) => sent,
            };
            if sent.is_err() {
                break LoopExit::ClientGone;
            }
            self.ticket.add_bytes(len);
            chunks_sent += 1;
        };

        let status = match exit {
            LoopExit::EndOfStream => finish(&mut self.process).await,
            _ => self.process.terminate().await,
        };

        let end = match exit {
            LoopExit::EndOfStream => {
                if let Some(status) = status.filter(|s| !s.success()) {
                    debug!(%session_id, %status, "Transcoder exited with failure after output");
                }
                SessionEnd::Completed
            }
            LoopExit::ReadError(e) => {
                warn!(%session_id, error = %e, "Reading transcoder output failed");
                SessionEnd::ProcessFailed
            }
            LoopExit::ClientGone => SessionEnd::ClientDisconnected,
            LoopExit::Stopped => SessionEnd::Terminated,
        };
        self.ticket.set_state(end.into());

        let outcome = RelayOutcome {
            session_id,
            end,
            bytes_sent: self.ticket.bytes_sent(),
            chunks_sent,
            exit: status,
        };
        info!(
            %session_id,
            end = ?outcome.end,
            bytes = outcome.bytes_sent,
            chunks = outcome.chunks_sent,
            "Relay session ended"
        );
        outcome
    }
}

/// Reap a transcoder that closed its output, terminating it if it lingers.
async fn finish(process: &mut ProcessHandle) -> Option<ExitStatus> {
    match tokio::time::timeout(EXIT_GRACE, process.wait()).await {
        Ok(status) => status,
        Err(_) => process.terminate().await,
    }
}

async fn fail_before_output(ticket: &SessionTicket, process: &mut ProcessHandle) -> RelayError {
    let exit = process.terminate().await;
    let stderr = process.stderr_tail().await;
    ticket.set_state(SessionState::ProcessFailed);
    warn!(
        session_id = %ticket.id(),
        exit = ?exit,
        stderr = stderr.last().map_or("", String::as_str),
        "Transcoder failed before producing output"
    );
    RelayError::StreamFailure { exit, stderr }
}
