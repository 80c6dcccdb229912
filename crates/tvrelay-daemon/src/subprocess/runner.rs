//! Transcoder subprocess lifecycle.
//!
//! Spawns the external transcoder with stdout/stderr piped and stdin closed,
//! keeps a short tail of its stderr for diagnostics, and terminates it with a
//! graceful signal followed by SIGKILL once the timeout runs out.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Number of trailing stderr lines kept per process.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr reader to drain after exit.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Launches transcoder processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// Grace period between SIGTERM and SIGKILL.
    terminate_timeout: Duration,
}

impl ProcessRunner {
    pub const fn new(terminate_timeout: Duration) -> Self {
        Self { terminate_timeout }
    }

    /// Spawn one process for a fully rendered argv (program first).
    ///
    /// Must be called from within a tokio runtime. Launch failures are
    /// returned as-is; retrying is up to the caller.
    pub fn start(&self, argv: &[String]) -> Result<ProcessHandle, SubprocessError> {
        let (program, args) = argv.split_first().ok_or(SubprocessError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SubprocessError::SpawnFailed {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| SubprocessError::Pipe {
            program: program.clone(),
            stream: "stdout",
        })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                            if line.is_empty() {
                                continue;
                            }
                            debug!(pid, "stderr: {}", line);
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    }
                }
                debug!(pid, "stderr reader finished");
                Vec::from(tail)
            })
        });

        info!(pid, program = %program, args = args.len(), "Spawned transcoder");

        Ok(ProcessHandle {
            pid,
            child,
            stdout: Some(stdout),
            stderr_task,
            exit: None,
            terminate_timeout: self.terminate_timeout,
        })
    }
}

/// One live transcoder process.
///
/// Dropping the handle without calling [`ProcessHandle::terminate`] kills the
/// process and leaves reaping to the runtime.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    /// Set once the process has been reaped.
    exit: Option<ExitStatus>,
    terminate_timeout: Duration,
}

impl ProcessHandle {
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the stdout pipe. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Exit status, if the process has already been reaped.
    pub const fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Signal the process and reap it.
    ///
    /// Sends SIGTERM, waits up to the configured timeout, then SIGKILLs.
    /// Calling this on an exited or already terminated process only returns
    /// the recorded status. `None` means the process could not be reaped.
    pub async fn terminate(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit {
            return Some(status);
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = self.pid, %status, "Transcoder already exited");
                self.exit = Some(status);
                return Some(status);
            }
            Ok(None) => {}
            Err(e) => warn!(pid = self.pid, error = %e, "Failed to poll transcoder status"),
        }

        self.send_sigterm();

        let status = match tokio::time::timeout(self.terminate_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = self.pid, %status, "Transcoder exited after SIGTERM");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Error waiting for transcoder, killing");
                self.kill().await
            }
            Err(_) => {
                warn!(pid = self.pid, "Timeout waiting for transcoder shutdown, killing");
                self.kill().await
            }
        };
        self.exit = status;
        status
    }

    /// Wait for the process to exit on its own and reap it.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.wait().await {
                Ok(status) => self.exit = Some(status),
                Err(e) => warn!(pid = self.pid, error = %e, "Error waiting for transcoder"),
            }
        }
        self.exit
    }

    /// Last stderr lines. Waits briefly for the reader to drain; the tail is
    /// only available once.
    pub async fn stderr_tail(&mut self) -> Vec<String> {
        let Some(task) = self.stderr_task.take() else {
            return Vec::new();
        };
        match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "stderr reader task failed");
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        // SAFETY: pid comes from our own, not yet reaped Child handle.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, error = %err, "Failed to send SIGTERM");
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(pid = self.pid, error = %e, "Failed to kill transcoder");
        }
    }

    async fn kill(&mut self) -> Option<ExitStatus> {
        if let Err(e) = self.child.kill().await {
            warn!(pid = self.pid, error = %e, "Failed to kill transcoder");
        }
        self.child.try_wait().ok().flatten()
    }
}

/// Errors launching a transcoder.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Empty transcoder command line")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture {stream} of {program}")]
    Pipe {
        program: String,
        stream: &'static str,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        assert!(matches!(
            runner().start(&[]),
            Err(SubprocessError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let err = runner()
            .start(&["/nonexistent/transcoder".to_string()])
            .unwrap_err();
        assert!(matches!(err, SubprocessError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn stdout_is_readable_and_stdin_closed() {
        // `cat` exits immediately because stdin is /dev/null.
        let mut handle = runner().start(&sh("cat; printf done")).unwrap();
        let mut out = String::new();
        handle
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert!(handle.take_stdout().is_none());
        assert!(handle.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn terminate_signals_running_process() {
        let mut handle = runner().start(&sh("exec sleep 30")).unwrap();
        assert!(handle.pid().is_some());
        let status = handle.terminate().await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(libc::SIGTERM));
        }
        assert!(!status.success());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mut handle = runner().start(&sh("exec sleep 30")).unwrap();
        let first = handle.terminate().await;
        let second = handle.terminate().await;
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(handle.exit_status(), first);
    }

    #[tokio::test]
    async fn terminate_after_natural_exit_is_noop() {
        let mut handle = runner().start(&sh("exit 0")).unwrap();
        let waited = handle.wait().await.unwrap();
        assert!(waited.success());
        assert_eq!(handle.terminate().await, Some(waited));
    }

    #[tokio::test]
    async fn kills_process_ignoring_sigterm() {
        let runner = ProcessRunner::new(Duration::from_millis(200));
        let mut handle = runner
            .start(&sh("trap '' TERM; printf ready; while :; do sleep 1; done"))
            .unwrap();
        let mut stdout = handle.take_stdout().unwrap();
        let mut buf = [0u8; 5];
        stdout.read_exact(&mut buf).await.unwrap();

        let status = handle.terminate().await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(libc::SIGKILL));
        }
    }

    #[tokio::test]
    async fn stderr_tail_is_captured() {
        let mut handle = runner()
            .start(&sh("echo first >&2; echo second >&2; exit 3"))
            .unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(handle.stderr_tail().await, ["first", "second"]);
        assert!(handle.stderr_tail().await.is_empty());
    }
}
