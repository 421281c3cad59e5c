//! Caller-facing notifications: live output, readiness, late responses, termination.

use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LockResultExt;

/// One line of child output, published as soon as it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Sequence id of the command outstanding when the line arrived.
    pub seq: Option<u64>,
    pub text: String,
    pub is_prompt: bool,
}

/// Output that ended with the prompt of a command whose submitter already timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateResponse {
    pub seq: u64,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The child closed its output stream.
    EndOfStream,
    /// Reading the output stream failed.
    ReadError(String),
    /// Writing a command to the child failed.
    WriteError(String),
    /// The process could not be started.
    SpawnFailed(String),
    /// `shutdown()` was requested by the host.
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::EndOfStream => f.write_str("process exited"),
            TerminationReason::ReadError(reason) => write!(f, "read error: {reason}"),
            TerminationReason::WriteError(reason) => write!(f, "write error: {reason}"),
            TerminationReason::SpawnFailed(reason) => write!(f, "failed to start: {reason}"),
            TerminationReason::Shutdown => f.write_str("shut down"),
        }
    }
}

/// Terminal event, delivered exactly once per bridge.
#[derive(Debug, Clone)]
pub struct Termination {
    pub identity: String,
    pub reason: TerminationReason,
    pub exit_status: Option<ExitStatus>,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.identity, self.reason)?;
        if let Some(status) = self.exit_status {
            write!(f, " ({status})")?;
        }
        Ok(())
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Signal = Arc<dyn Fn() + Send + Sync>;

/// Registered callbacks. They run on the drain task, so they must return quickly.
#[derive(Default)]
pub(crate) struct EventSink {
    output: Mutex<Vec<Listener<OutputLine>>>,
    ready: Mutex<Vec<Signal>>,
    late: Mutex<Vec<Listener<LateResponse>>>,
    clear: Mutex<Vec<Signal>>,
    terminated: Mutex<Vec<Listener<Termination>>>,
    terminated_sent: AtomicBool,
}

impl EventSink {
    pub(crate) fn on_output_line(&self, listener: Listener<OutputLine>) {
        self.output
            .lock()
            .recover_poison("EventSink::on_output_line")
            .push(listener);
    }

    pub(crate) fn on_ready(&self, listener: Signal) {
        self.ready
            .lock()
            .recover_poison("EventSink::on_ready")
            .push(listener);
    }

    pub(crate) fn on_late_response(&self, listener: Listener<LateResponse>) {
        self.late
            .lock()
            .recover_poison("EventSink::on_late_response")
            .push(listener);
    }

    pub(crate) fn on_clear_screen(&self, listener: Signal) {
        self.clear
            .lock()
            .recover_poison("EventSink::on_clear_screen")
            .push(listener);
    }

    pub(crate) fn on_terminated(&self, listener: Listener<Termination>) {
        self.terminated
            .lock()
            .recover_poison("EventSink::on_terminated")
            .push(listener);
    }

    // Listeners are cloned out before being called so a listener may register another.

    pub(crate) fn emit_output(&self, line: &OutputLine) {
        let listeners = self.output.lock().recover_poison("EventSink::emit_output").clone();
        for listener in listeners {
            listener(line);
        }
    }

    pub(crate) fn emit_ready(&self) {
        let listeners = self.ready.lock().recover_poison("EventSink::emit_ready").clone();
        for listener in listeners {
            listener();
        }
    }

    pub(crate) fn emit_late(&self, late: &LateResponse) {
        let listeners = self.late.lock().recover_poison("EventSink::emit_late").clone();
        for listener in listeners {
            listener(late);
        }
    }

    pub(crate) fn emit_clear(&self) {
        let listeners = self.clear.lock().recover_poison("EventSink::emit_clear").clone();
        for listener in listeners {
            listener();
        }
    }

    /// Deliver the termination event. Returns false if one was already delivered.
    pub(crate) fn emit_terminated(&self, termination: &Termination) -> bool {
        if self.terminated_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listeners = self
            .terminated
            .lock()
            .recover_poison("EventSink::emit_terminated")
            .clone();
        for listener in listeners {
            listener(termination);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn termination_is_delivered_once() {
        let sink = EventSink::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        sink.on_terminated(Arc::new(move |_: &Termination| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let termination = Termination {
            identity: "REPL-1".into(),
            reason: TerminationReason::EndOfStream,
            exit_status: None,
        };
        assert!(sink.emit_terminated(&termination));
        assert!(!sink.emit_terminated(&termination));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_reaches_every_listener_in_registration_order() {
        let sink = EventSink::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            sink.on_output_line(Arc::new(move |line: &OutputLine| {
                seen.lock().unwrap().push(format!("{tag}:{}", line.text));
            }));
        }

        sink.emit_output(&OutputLine {
            seq: None,
            text: "hello".into(),
            is_prompt: false,
        });
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:hello".to_string(), "second:hello".to_string()]
        );
    }

    #[test]
    fn listener_may_register_another_listener() {
        let sink = Arc::new(EventSink::default());
        let inner_sink = Arc::clone(&sink);
        sink.on_ready(Arc::new(move || {
            inner_sink.on_ready(Arc::new(|| {}));
        }));
        sink.emit_ready();
        assert_eq!(sink.ready.lock().unwrap().len(), 2);
    }

    #[test]
    fn termination_display_names_identity_and_reason() {
        let termination = Termination {
            identity: "REPL-2".into(),
            reason: TerminationReason::WriteError("broken pipe".into()),
            exit_status: None,
        };
        assert_eq!(termination.to_string(), "REPL-2 write error: broken pipe");
    }
}
