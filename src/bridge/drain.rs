//! Output drain task.
//!
//! Reads the child's output for the whole active life of a bridge, splits it into lines,
//! publishes each line to the live-output listeners, and feeds prompt boundaries into
//! the readiness state. Runs independently of any caller.
//!
//! # Cancellation
//!
//! The read sits in a `tokio::select!` against a [`CancellationToken`], so cancelling never
//! waits for the child to produce output. Reads are chunk based, which keeps them cancel
//! safe: no bytes are lost inside a dropped future.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::BridgeCore;
use super::events::{OutputLine, TerminationReason};
use super::supervisor::OutputSource;
use crate::config::PromptMatcher;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Accumulates raw output bytes and yields complete lines.
///
/// `\n` ends a line and a preceding `\r` is dropped. Invalid UTF-8 is replaced lossily.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&line[..pos]));
        }
        lines
    }

    /// Take the unterminated tail if `accept` says it is complete on its own (a prompt).
    pub(crate) fn take_partial_if(&mut self, accept: impl FnOnce(&str) -> bool) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let partial = decode_line(&self.buf);
        if accept(&partial) {
            self.buf.clear();
            Some(partial)
        } else {
            None
        }
    }

    /// Take whatever is left at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = decode_line(&self.buf);
        self.buf.clear();
        Some(rest)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Handle to the spawned drain task.
///
/// Dropping the handle cancels the task.
pub(crate) struct DrainTaskHandle {
    join_handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl DrainTaskHandle {
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Wait up to `limit` for the task to finish; abort it if it does not.
    ///
    /// Returns true if the task finished on its own.
    pub(crate) async fn join(mut self, limit: Duration) -> bool {
        let Some(handle) = self.join_handle.take() else {
            return true;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                if e.is_panic() {
                    error!(target: "replbridge::drain", "Drain task panicked: {}", e);
                }
                true
            }
            Err(_) => {
                abort.abort();
                false
            }
        }
    }
}

impl Drop for DrainTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn the drain task for `core`.
pub(crate) fn spawn_drain_task(
    output: OutputSource,
    matcher: PromptMatcher,
    core: Arc<BridgeCore>,
) -> DrainTaskHandle {
    let cancel_token = CancellationToken::new();
    let token_clone = cancel_token.clone();
    let join_handle = tokio::spawn(drain_loop(output, matcher, core, token_clone));
    DrainTaskHandle {
        join_handle: Some(join_handle),
        cancel_token,
    }
}

#[derive(Debug)]
enum DrainEnd {
    Cancelled,
    EndOfStream,
    ReadError(io::Error),
}

async fn drain_loop(
    mut output: OutputSource,
    matcher: PromptMatcher,
    core: Arc<BridgeCore>,
    cancel_token: CancellationToken,
) {
    let mut splitter = LineSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break DrainEnd::Cancelled,
            result = output.read(&mut chunk) => match result {
                Ok(0) => break DrainEnd::EndOfStream,
                Ok(n) => {
                    for line in splitter.push(&chunk[..n]) {
                        dispatch_output(&core, &matcher, line);
                    }
                    if matcher.matches_partial_lines() {
                        if let Some(prompt) = splitter.take_partial_if(|tail| matcher.is_prompt(tail)) {
                            dispatch_line(&core, &matcher, prompt);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break DrainEnd::ReadError(e),
            }
        }
    };

    match end {
        DrainEnd::Cancelled => {
            debug!(
                target: "replbridge::drain",
                "{}: drain task cancelled, shutting down",
                core.identity()
            );
        }
        DrainEnd::EndOfStream => {
            if let Some(rest) = splitter.finish() {
                dispatch_output(&core, &matcher, rest);
            }
            info!(
                target: "replbridge::drain",
                "{}: output closed, process exited",
                core.identity()
            );
            core.finish(TerminationReason::EndOfStream).await;
        }
        DrainEnd::ReadError(e) => {
            warn!(
                target: "replbridge::drain",
                "{}: failed to read output: {}",
                core.identity(),
                e
            );
            core.finish(TerminationReason::ReadError(e.to_string())).await;
        }
    }
}

/// Dispatch a complete line, first splitting off any prompts glued to its start.
fn dispatch_output(core: &BridgeCore, matcher: &PromptMatcher, mut text: String) {
    if matcher.matches_partial_lines() {
        while let Some(len) = matcher.prompt_prefix_len(&text) {
            let rest = text.split_off(len);
            dispatch_line(core, matcher, text);
            text = rest;
        }
    }
    dispatch_line(core, matcher, text);
}

/// Publish one line, then apply its effect on the readiness state.
///
/// Publishing first keeps listeners from seeing a prompt boundary ahead of the text
/// that preceded it.
fn dispatch_line(core: &BridgeCore, matcher: &PromptMatcher, text: String) {
    let is_prompt = matcher.is_prompt(&text);
    trace!(
        target: "replbridge::drain",
        "{}: {:?} (prompt: {})",
        core.identity(),
        text,
        is_prompt
    );

    let readiness = core.readiness();
    let events = core.events();
    events.emit_output(&OutputLine {
        seq: readiness.outstanding_seq(),
        text: text.clone(),
        is_prompt,
    });

    let observed = readiness.observe_line(text, is_prompt);
    if observed.first_prompt {
        info!(
            target: "replbridge::drain",
            "{} ready for input",
            core.identity()
        );
        events.emit_ready();
    }
    if let Some(seq) = observed.completed {
        debug!(
            target: "replbridge::drain",
            "{}: command #{} completed",
            core.identity(),
            seq
        );
    }
    if let Some(late) = observed.late {
        warn!(
            target: "replbridge::drain",
            "{}: late response for timed-out command #{} ({} lines)",
            core.identity(),
            late.seq,
            late.lines.len()
        );
        events.emit_late(&late);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::events::{LateResponse, Termination};
    use crate::bridge::state::LifecycleState;
    use crate::config::BridgeTimeouts;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};

    #[test]
    fn splitter_yields_complete_lines_only() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"one\ntw"), vec!["one".to_string()]);
        assert_eq!(splitter.push(b"o\r\nthree"), vec!["two".to_string()]);
        assert_eq!(splitter.finish(), Some("three".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_keeps_empty_lines() {
        let mut splitter = LineSplitter::new();
        assert_eq!(
            splitter.push(b"\n\nx\n"),
            vec![String::new(), String::new(), "x".to_string()]
        );
    }

    #[test]
    fn splitter_replaces_invalid_utf8() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"caf\xff\n");
        assert_eq!(lines, vec!["caf\u{fffd}".to_string()]);
    }

    #[test]
    fn partial_tail_is_taken_only_when_accepted() {
        let mut splitter = LineSplitter::new();
        splitter.push(b"result\n>>> ");
        assert_eq!(splitter.take_partial_if(|tail| tail == "nope"), None);
        assert_eq!(
            splitter.take_partial_if(|tail| tail.starts_with(">>> ")),
            Some(">>> ".to_string())
        );
        assert_eq!(splitter.finish(), None);
    }

    struct Harness {
        core: Arc<BridgeCore>,
        writer: DuplexStream,
        handle: DrainTaskHandle,
        lines: Arc<Mutex<Vec<OutputLine>>>,
        late: Arc<Mutex<Vec<LateResponse>>>,
        ready_count: Arc<Mutex<usize>>,
    }

    fn harness(matcher: PromptMatcher) -> Harness {
        let core = Arc::new(BridgeCore::new("REPL-T", BridgeTimeouts::default()));
        assert!(core.readiness().mark_spawned());

        let lines = Arc::new(Mutex::new(Vec::new()));
        let late = Arc::new(Mutex::new(Vec::new()));
        let ready_count = Arc::new(Mutex::new(0));
        {
            let lines = Arc::clone(&lines);
            core.events().on_output_line(Arc::new(move |line: &OutputLine| {
                lines.lock().unwrap().push(line.clone());
            }));
            let late = Arc::clone(&late);
            core.events().on_late_response(Arc::new(move |response: &LateResponse| {
                late.lock().unwrap().push(response.clone());
            }));
            let ready_count = Arc::clone(&ready_count);
            core.events().on_ready(Arc::new(move || {
                *ready_count.lock().unwrap() += 1;
            }));
        }

        let (writer, reader) = tokio::io::duplex(1024);
        let handle = spawn_drain_task(Box::new(reader), matcher, Arc::clone(&core));
        Harness {
            core,
            writer,
            handle,
            lines,
            late,
            ready_count,
        }
    }

    async fn wait_for_state(core: &BridgeCore, expected: LifecycleState) {
        let mut rx = core.readiness().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
            .await
            .expect("state transition timed out")
            .expect("state channel closed");
    }

    fn python_prompt() -> PromptMatcher {
        PromptMatcher::new(r"^(>>> |\.\.\. )").unwrap()
    }

    #[tokio::test]
    async fn first_prompt_makes_bridge_ready_once() {
        let mut h = harness(python_prompt());
        h.writer
            .write_all(b"Python 3.12\nType help\n>>> ")
            .await
            .unwrap();
        wait_for_state(&h.core, LifecycleState::Ready).await;

        h.writer.write_all(b"\n>>> ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*h.ready_count.lock().unwrap(), 1);
        let lines = h.lines.lock().unwrap();
        assert_eq!(lines[0].text, "Python 3.12");
        assert!(!lines[0].is_prompt);
        assert_eq!(lines[2].text, ">>> ");
        assert!(lines[2].is_prompt);
    }

    #[tokio::test]
    async fn prompt_completes_outstanding_command() {
        let mut h = harness(python_prompt());
        h.writer.write_all(b">>> ").await.unwrap();
        wait_for_state(&h.core, LifecycleState::Ready).await;

        let (seq, rx) = h.core.readiness().try_admit().unwrap();
        h.writer.write_all(b"2\n>>> ").await.unwrap();
        let completion = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(completion.lines, vec!["2".to_string()]);
        assert!(h.core.readiness().state().is_ready());
        let lines = h.lines.lock().unwrap();
        let result_line = lines.iter().find(|l| l.text == "2").unwrap();
        assert_eq!(result_line.seq, Some(seq));
    }

    #[tokio::test]
    async fn prompt_glued_to_next_line_still_ends_the_command() {
        let mut h = harness(PromptMatcher::new("^> $").unwrap());
        h.writer.write_all(b"> ").await.unwrap();
        wait_for_state(&h.core, LifecycleState::Ready).await;

        let (seq, rx) = h.core.readiness().try_admit().unwrap();
        // The whole burst arrives in one read
        h.writer.write_all(b"x\n> y\n> ").await.unwrap();
        let completion = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.lines, vec!["x".to_string()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.core.readiness().state().is_ready());
        let lines = h.lines.lock().unwrap();
        let seen: Vec<(&str, bool)> = lines
            .iter()
            .map(|l| (l.text.as_str(), l.is_prompt))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("> ", true),
                ("x", false),
                ("> ", true),
                ("y", false),
                ("> ", true)
            ]
        );
        assert_eq!(lines[1].seq, Some(seq));
        assert_eq!(lines[3].seq, None);
    }

    #[tokio::test]
    async fn partial_prompts_can_be_disabled() {
        let mut h = harness(python_prompt().with_partial_lines(false));
        h.writer.write_all(b">>> ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.core.readiness().state(),
            LifecycleState::AwaitingFirstPrompt
        );

        h.writer.write_all(b"\n").await.unwrap();
        wait_for_state(&h.core, LifecycleState::Ready).await;
    }

    #[tokio::test]
    async fn late_prompt_after_abandon_is_reported() {
        let mut h = harness(python_prompt());
        h.writer.write_all(b">>> ").await.unwrap();
        wait_for_state(&h.core, LifecycleState::Ready).await;

        let (seq, _rx) = h.core.readiness().try_admit().unwrap();
        assert!(h.core.readiness().abandon(seq));
        h.writer.write_all(b"slow\n>>> ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let late = h.late.lock().unwrap();
        assert_eq!(
            *late,
            vec![LateResponse {
                seq,
                lines: vec!["slow".to_string()]
            }]
        );
    }

    #[tokio::test]
    async fn end_of_stream_terminates_bridge() {
        let mut h = harness(python_prompt());
        h.writer.write_all(b">>> \nbye").await.unwrap();
        drop(h.writer);

        wait_for_state(&h.core, LifecycleState::Terminated).await;
        assert!(h.handle.join(Duration::from_secs(1)).await);
        let lines = h.lines.lock().unwrap();
        assert_eq!(lines.last().unwrap().text, "bye");
    }

    struct BrokenOutput;

    impl AsyncRead for BrokenOutput {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("device vanished")))
        }
    }

    #[tokio::test]
    async fn read_failure_terminates_bridge_once() {
        let core = Arc::new(BridgeCore::new("REPL-T", BridgeTimeouts::default()));
        assert!(core.readiness().mark_spawned());
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = Arc::clone(&reasons);
            core.events().on_terminated(Arc::new(move |t: &Termination| {
                reasons.lock().unwrap().push(t.reason.clone());
            }));
        }

        let handle = spawn_drain_task(Box::new(BrokenOutput), python_prompt(), Arc::clone(&core));
        assert!(handle.join(Duration::from_secs(5)).await);

        assert_eq!(core.readiness().state(), LifecycleState::Terminated);
        let reasons = reasons.lock().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(
            matches!(&reasons[0], TerminationReason::ReadError(msg) if msg.contains("device vanished")),
            "unexpected reason: {:?}",
            reasons[0]
        );
    }

    #[tokio::test]
    async fn cancellation_does_not_wait_for_output() {
        let h = harness(python_prompt());
        h.handle.cancel();
        assert!(h.handle.join(Duration::from_secs(1)).await);
        // Cancelled, not terminated: teardown is the lifecycle controller's job
        assert_eq!(
            h.core.readiness().state(),
            LifecycleState::AwaitingFirstPrompt
        );
        drop(h.writer);
    }
}
