//! Process supervisor: owns the REPL child process and its stdio.
//!
//! The supervisor is the only component that signals the child. Callers reach the child's
//! stdin through [`InputSink`] and its output through the drain task.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::config::LaunchSpec;
use crate::error::LockResultExt;

/// Merged (or stdout-only) output of the child.
pub(crate) type OutputSource = Box<dyn AsyncRead + Send + Unpin>;

type InputStream = Box<dyn AsyncWrite + Send + Unpin>;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Handles produced by a successful spawn.
pub(crate) struct SpawnedProcess {
    pub(crate) supervisor: ProcessSupervisor,
    pub(crate) input: InputSink,
    pub(crate) output: OutputSource,
}

pub(crate) struct ProcessSupervisor {
    child: Mutex<Child>,
    pid: Option<u32>,
    exit_status: Mutex<Option<ExitStatus>>,
}

impl ProcessSupervisor {
    /// Spawn the REPL described by `spec`.
    ///
    /// With stderr merging (the default) both output streams of the child share one pipe,
    /// so error text interleaves with normal output in the order it was written.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        let mut command = Command::new(spec.command());
        command
            .args(spec.args())
            .stdin(Stdio::piped())
            .kill_on_drop(true);

        let merged = if spec.merges_stderr() {
            merged_output(&mut command)?
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::null());
            None
        };

        let mut child = command.spawn()?;
        // The command still holds the parent's copies of the pipe write ends; end of
        // stream is only observable once they are closed.
        drop(command);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin was not captured"))?;
        let output: OutputSource = match merged {
            Some(output) => output,
            None => Box::new(
                child
                    .stdout
                    .take()
                    .ok_or_else(|| io::Error::other("child stdout was not captured"))?,
            ),
        };

        let pid = child.id();
        debug!(
            target: "replbridge::supervisor",
            "Spawned {} (pid {:?})",
            spec.command_line(),
            pid
        );

        Ok(SpawnedProcess {
            supervisor: ProcessSupervisor {
                child: Mutex::new(child),
                pid,
                exit_status: Mutex::new(None),
            },
            input: InputSink::new(Box::new(stdin)),
            output,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness probe. Reaps the child and records its status once it exits.
    pub(crate) fn is_alive(&self) -> bool {
        if self.exit_status().is_some() {
            return false;
        }
        let mut child = self.child.lock().recover_poison("ProcessSupervisor::is_alive");
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                *self
                    .exit_status
                    .lock()
                    .recover_poison("ProcessSupervisor::is_alive") = Some(status);
                false
            }
            Err(e) => {
                warn!(
                    target: "replbridge::supervisor",
                    "Failed to poll child {:?}: {}",
                    self.pid,
                    e
                );
                false
            }
        }
    }

    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        *self
            .exit_status
            .lock()
            .recover_poison("ProcessSupervisor::exit_status")
    }

    /// Signal the child. Graceful sends SIGTERM on unix; otherwise the child is killed.
    ///
    /// Signalling a child that already exited is a no-op.
    pub(crate) fn terminate(&self, graceful: bool) -> io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        if graceful {
            self.request_exit()
        } else {
            self.child
                .lock()
                .recover_poison("ProcessSupervisor::terminate")
                .start_kill()
        }
    }

    #[cfg(unix)]
    fn request_exit(&self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(io::Error::other)?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn request_exit(&self) -> io::Result<()> {
        // No SIGTERM equivalent; the only way to end the child is to kill it
        self.child
            .lock()
            .recover_poison("ProcessSupervisor::request_exit")
            .start_kill()
    }

    /// Wait up to `limit` for the child to exit. Returns true once it has.
    pub(crate) async fn wait_for_exit(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if !self.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(unix)]
fn merged_output(command: &mut Command) -> io::Result<Option<OutputSource>> {
    use std::os::fd::OwnedFd;
    use tokio::net::unix::pipe;

    let (reader, writer) = std::io::pipe()?;
    let stderr_writer = writer.try_clone()?;
    command.stdout(writer).stderr(stderr_writer);

    let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok(Some(Box::new(receiver)))
}

#[cfg(not(unix))]
fn merged_output(command: &mut Command) -> io::Result<Option<OutputSource>> {
    warn!(
        target: "replbridge::supervisor",
        "Merging stderr into stdout is not supported on this platform; stderr is discarded"
    );
    command.stdout(Stdio::piped()).stderr(Stdio::null());
    Ok(None)
}

/// Write side of the child's stdin. Closing it signals EOF to the child.
pub(crate) struct InputSink {
    stream: tokio::sync::Mutex<Option<InputStream>>,
}

impl InputSink {
    pub(crate) fn new(stream: InputStream) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(Some(stream)),
        }
    }

    /// Write `text` plus a newline and flush immediately.
    pub(crate) async fn write_line(&self, text: &str) -> io::Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "input stream is closed"))?;

        let mut payload = String::with_capacity(text.len() + 1);
        payload.push_str(text.trim_end_matches(['\r', '\n']));
        payload.push('\n');
        stream.write_all(payload.as_bytes()).await?;
        stream.flush().await
    }

    /// Close the stream, waiting at most `limit` for an in-progress write to release it.
    ///
    /// Returns false if the stream could not be acquired in time.
    pub(crate) async fn close(&self, limit: Duration) -> bool {
        match tokio::time::timeout(limit, self.stream.lock()).await {
            Ok(mut guard) => {
                if let Some(mut stream) = guard.take() {
                    // Dropping the stream closes the descriptor even if shutdown fails
                    let _ = stream.shutdown().await;
                }
                true
            }
            Err(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_closed(&self) -> bool {
        self.stream.lock().await.is_none()
    }
}
