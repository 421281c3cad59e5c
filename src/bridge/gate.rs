//! Command gate: the only path by which callers reach the child's stdin.
//!
//! At most one command is in flight per bridge. A second submission while one is
//! outstanding is refused with `NotReady`; the gate never queues.
//!
//! # Late responses
//!
//! When a command times out the bridge returns to Ready, but the child may still answer.
//! Every admitted command carries a sequence id. If the abandoned command's prompt shows
//! up while the bridge is idle, its output is reported through `on_late_response`. If the
//! next command is already in flight, the two outputs cannot be told apart; that command's
//! [`Response::late_output_from`] names the abandoned sequence so hosts can flag it.

use std::sync::Arc;

use log::{debug, warn};
use tokio::task::JoinHandle;

use super::events::TerminationReason;
use super::state::Rejection;
use super::{Bridge, BridgeCore};
use crate::error::{BridgeError, BridgeResult};

/// Output of one completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub seq: u64,
    /// Lines printed between the command and the next prompt, prompt excluded.
    pub lines: Vec<String>,
    /// Sequence id of an earlier timed-out command whose output may be mixed in.
    pub late_output_from: Option<u64>,
    /// Lines dropped because the response exceeded the buffer cap.
    pub dropped_lines: usize,
}

impl Response {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Outcome of [`Bridge::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The command ran and a prompt came back.
    Output(Response),
    /// The clear-screen directive was handled locally; nothing reached the child.
    ClearScreen,
    /// An exit directive shut the bridge down.
    Exited,
}

/// Inputs intercepted before they reach the child. Compared after trimming whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directives {
    clear: Option<String>,
    exit: Vec<String>,
}

impl Default for Directives {
    fn default() -> Self {
        Self {
            clear: Some("clear".to_string()),
            exit: vec!["exit".to_string(), "quit".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalDirective {
    ClearScreen,
    Exit,
}

impl Directives {
    pub fn new(clear: Option<String>, exit: Vec<String>) -> Self {
        Self { clear, exit }
    }

    /// Pass every input through to the child.
    pub fn none() -> Self {
        Self {
            clear: None,
            exit: Vec::new(),
        }
    }

    pub fn clear(&self) -> Option<&str> {
        self.clear.as_deref()
    }

    pub fn exit(&self) -> &[String] {
        &self.exit
    }

    fn classify(&self, input: &str) -> Option<LocalDirective> {
        let input = input.trim();
        if self.clear.as_deref() == Some(input) {
            return Some(LocalDirective::ClearScreen);
        }
        if self.exit.iter().any(|e| e == input) {
            return Some(LocalDirective::Exit);
        }
        None
    }
}

impl Bridge {
    /// Submit one command and wait for the next prompt.
    ///
    /// Fails fast with `ProcessNotRunning` if the bridge is not started, shutting down or
    /// gone, and with `NotReady` while the first prompt is pending or a command is in
    /// flight. Writing and waiting share the response timeout; on `Timeout` the bridge
    /// accepts commands again. A write that cannot finish in time is a `Write` error and
    /// ends the bridge.
    ///
    /// Dropping the returned future after the command was written counts as a timeout:
    /// the gate reopens and the command's output is reported as late.
    pub async fn submit(&self, command: &str) -> BridgeResult<Reply> {
        match self.inner.directives.classify(command) {
            Some(LocalDirective::ClearScreen) => {
                self.inner.core.events().emit_clear();
                return Ok(Reply::ClearScreen);
            }
            Some(LocalDirective::Exit) => {
                self.shutdown().await;
                return Ok(Reply::Exited);
            }
            None => {}
        }
        self.inner.core.send_command(command).await.map(Reply::Output)
    }

    /// Run [`submit`](Self::submit) on a spawned task so the caller never awaits process I/O.
    pub fn submit_detached(&self, command: impl Into<String>) -> JoinHandle<BridgeResult<Reply>> {
        let bridge = self.clone();
        let command = command.into();
        tokio::spawn(async move { bridge.submit(&command).await })
    }
}

enum Failure {
    Write(std::io::Error),
    Closed,
}

/// An admitted command whose outcome the gate has not settled yet.
///
/// If `send_command` is dropped while waiting (the caller gave up), the command is
/// abandoned so the gate opens again. If it is dropped while writing, a partial line may
/// be sitting in the child's stdin, so the bridge is torn down instead.
struct InFlight {
    core: Arc<BridgeCore>,
    seq: u64,
    written: bool,
    settled: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.written {
            if self.core.readiness().abandon(self.seq) {
                debug!(
                    target: "replbridge::gate",
                    "{}: caller stopped waiting for command #{}; accepting input again",
                    self.core.identity(),
                    self.seq
                );
            }
        } else {
            warn!(
                target: "replbridge::gate",
                "{}: caller stopped waiting while command #{} was being written",
                self.core.identity(),
                self.seq
            );
            self.core
                .fail_input(format!("write of command #{} was interrupted", self.seq));
        }
    }
}

impl BridgeCore {
    pub(crate) async fn send_command(self: &Arc<Self>, command: &str) -> BridgeResult<Response> {
        let Some(session) = self.session() else {
            return Err(BridgeError::process_not_running(self.identity()));
        };
        if !session.supervisor.is_alive() {
            return Err(BridgeError::process_not_running(self.identity()));
        }

        let (seq, completion_rx) = self.readiness().try_admit().map_err(|rejection| match rejection {
            Rejection::NotRunning => BridgeError::process_not_running(self.identity()),
            Rejection::NotReady => BridgeError::not_ready(self.identity()),
        })?;
        debug!(
            target: "replbridge::gate",
            "{}: sending command #{}: {:?}",
            self.identity(),
            seq,
            command
        );

        let mut in_flight = InFlight {
            core: Arc::clone(self),
            seq,
            written: false,
            settled: false,
        };
        let limit = self.timeouts().response.as_duration();
        let outcome = tokio::time::timeout(limit, async {
            session
                .input
                .write_line(command)
                .await
                .map_err(Failure::Write)?;
            in_flight.written = true;
            completion_rx.await.map_err(|_| Failure::Closed)
        })
        .await;
        in_flight.settled = true;

        match outcome {
            Ok(Ok(completion)) => Ok(Response {
                seq,
                lines: completion.lines,
                late_output_from: completion.late_output_from,
                dropped_lines: completion.dropped_lines,
            }),
            Ok(Err(Failure::Write(e))) => {
                warn!(
                    target: "replbridge::gate",
                    "{}: failed to write command #{}: {}",
                    self.identity(),
                    seq,
                    e
                );
                self.fail_input(e.to_string());
                Err(BridgeError::write(self.identity(), e.to_string()))
            }
            Ok(Err(Failure::Closed)) => Err(BridgeError::process_not_running(self.identity())),
            Err(_elapsed) if !in_flight.written => {
                // The child stopped reading; part of the line may already be in the pipe
                warn!(
                    target: "replbridge::gate",
                    "{}: command #{} could not be written within {:?}",
                    self.identity(),
                    seq,
                    limit
                );
                let reason = format!("timed out after {limit:?} writing command #{seq}");
                self.fail_input(reason.clone());
                Err(BridgeError::write(self.identity(), reason))
            }
            Err(_elapsed) => {
                if self.readiness().abandon(seq) {
                    warn!(
                        target: "replbridge::gate",
                        "{}: command #{} timed out after {:?}; accepting input again",
                        self.identity(),
                        seq,
                        limit
                    );
                }
                Err(BridgeError::timeout(self.identity(), limit))
            }
        }
    }

    /// Tear the bridge down in the background after its input stream broke.
    fn fail_input(self: &Arc<Self>, reason: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let core = Arc::clone(self);
        runtime.spawn(async move {
            core.finish(TerminationReason::WriteError(reason)).await;
        });
    }
}
