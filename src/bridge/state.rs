//! Readiness state shared by the drain task (producer) and the command gate (consumer).
//!
//! All mutable bridge state lives behind one mutex: lifecycle state, the pending response
//! buffer, the outstanding submission, and the sequence counter. A watch channel mirrors
//! the lifecycle state so hosts can await transitions without polling.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::{oneshot, watch};

use super::events::LateResponse;
use crate::error::LockResultExt;

/// Upper bound on lines buffered between two prompt boundaries.
pub(crate) const MAX_PENDING_LINES: usize = 10_000;

/// Lifecycle of one bridge.
///
/// State transitions:
/// - Starting -> AwaitingFirstPrompt (process spawned)
/// - AwaitingFirstPrompt -> Ready (first prompt observed)
/// - Ready -> Busy (command admitted)
/// - Busy -> Ready (prompt observed, or response timeout)
/// - any non-terminal state -> ShuttingDown (shutdown, end of stream, transport failure)
/// - ShuttingDown -> Terminated (process gone, tasks released)
///
/// Terminated is final; a bridge is never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, process not spawned yet
    Starting,
    /// Process spawned, no prompt seen yet
    AwaitingFirstPrompt,
    /// Idle at a prompt, accepts one command
    Ready,
    /// One command outstanding
    Busy,
    /// Teardown in progress
    ShuttingDown,
    /// Process gone (terminal state)
    Terminated,
}

impl LifecycleState {
    /// `readyForInput`: true exactly in the Ready state.
    pub fn is_ready(self) -> bool {
        self == LifecycleState::Ready
    }

    /// ShuttingDown or Terminated.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            LifecycleState::ShuttingDown | LifecycleState::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::AwaitingFirstPrompt => "awaiting-first-prompt",
            LifecycleState::Ready => "ready",
            LifecycleState::Busy => "busy",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output collected for one command, handed from the drain task to the waiting gate.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) lines: Vec<String>,
    /// Set when an earlier command timed out and its prompt had not been seen yet,
    /// so some of `lines` may belong to that command.
    pub(crate) late_output_from: Option<u64>,
    pub(crate) dropped_lines: usize,
}

/// Why a submission was refused. Refusals never change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    NotRunning,
    NotReady,
}

/// What a single output line did to the state.
#[derive(Debug, Default)]
pub(crate) struct LineObservation {
    pub(crate) first_prompt: bool,
    pub(crate) completed: Option<u64>,
    pub(crate) late: Option<LateResponse>,
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    pending: VecDeque<String>,
    dropped_lines: usize,
    waiter: Option<(u64, oneshot::Sender<Completion>)>,
    last_seq: u64,
    abandoned: Option<u64>,
}

pub(crate) struct ReadinessState {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<LifecycleState>,
}

impl ReadinessState {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Starting);
        Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Starting,
                pending: VecDeque::new(),
                dropped_lines: 0,
                waiter: None,
                last_seq: 0,
                abandoned: None,
            }),
            state_tx,
        }
    }

    fn lock(&self, context: &str) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().recover_poison(context)
    }

    fn set_state(&self, inner: &mut Inner, state: LifecycleState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.lock("ReadinessState::state").state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Sequence id of the command currently awaiting its prompt, if any.
    pub(crate) fn outstanding_seq(&self) -> Option<u64> {
        self.lock("ReadinessState::outstanding_seq")
            .waiter
            .as_ref()
            .map(|(seq, _)| *seq)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.lock("ReadinessState::pending_len").pending.len()
    }

    /// Starting -> AwaitingFirstPrompt. Returns false if the bridge already moved on.
    pub(crate) fn mark_spawned(&self) -> bool {
        let mut inner = self.lock("ReadinessState::mark_spawned");
        if inner.state != LifecycleState::Starting {
            return false;
        }
        self.set_state(&mut inner, LifecycleState::AwaitingFirstPrompt);
        true
    }

    /// Admit one command: Ready -> Busy, with a fresh sequence id and completion channel.
    pub(crate) fn try_admit(&self) -> Result<(u64, oneshot::Receiver<Completion>), Rejection> {
        let mut inner = self.lock("ReadinessState::try_admit");
        match inner.state {
            LifecycleState::Ready => {}
            LifecycleState::AwaitingFirstPrompt | LifecycleState::Busy => {
                return Err(Rejection::NotReady);
            }
            LifecycleState::Starting
            | LifecycleState::ShuttingDown
            | LifecycleState::Terminated => return Err(Rejection::NotRunning),
        }
        inner.last_seq += 1;
        let seq = inner.last_seq;
        let (tx, rx) = oneshot::channel();
        inner.waiter = Some((seq, tx));
        self.set_state(&mut inner, LifecycleState::Busy);
        Ok((seq, rx))
    }

    /// Feed one output line from the drain task.
    ///
    /// Ordinary lines are buffered. A prompt line is not buffered; it closes the current
    /// buffer, which goes to the waiting submitter, to the abandoned command as a late
    /// response, or nowhere (output printed while idle).
    pub(crate) fn observe_line(&self, line: String, is_prompt: bool) -> LineObservation {
        let mut inner = self.lock("ReadinessState::observe_line");
        let mut observation = LineObservation::default();

        if inner.state.is_closed() || inner.state == LifecycleState::Starting {
            return observation;
        }

        if !is_prompt {
            if inner.pending.len() >= MAX_PENDING_LINES {
                inner.pending.pop_front();
                inner.dropped_lines += 1;
            }
            inner.pending.push_back(line);
            return observation;
        }

        let lines: Vec<String> = inner.pending.drain(..).collect();
        let dropped_lines = std::mem::take(&mut inner.dropped_lines);

        let current = inner.state;
        match current {
            LifecycleState::AwaitingFirstPrompt => {
                observation.first_prompt = true;
                self.set_state(&mut inner, LifecycleState::Ready);
            }
            LifecycleState::Busy => {
                let late_output_from = inner.abandoned.take();
                if let Some((seq, tx)) = inner.waiter.take() {
                    observation.completed = Some(seq);
                    // The submitter may have given up in the same instant; nothing to do then
                    let _ = tx.send(Completion {
                        lines,
                        late_output_from,
                        dropped_lines,
                    });
                }
                self.set_state(&mut inner, LifecycleState::Ready);
            }
            LifecycleState::Ready => {
                if let Some(seq) = inner.abandoned.take() {
                    observation.late = Some(LateResponse { seq, lines });
                }
            }
            LifecycleState::Starting
            | LifecycleState::ShuttingDown
            | LifecycleState::Terminated => {}
        }

        observation
    }

    /// Give up on `seq` after a response timeout: Busy -> Ready, remembering `seq` so its
    /// prompt can be recognized if it shows up later.
    ///
    /// Returns false if `seq` is no longer outstanding (it completed or the bridge closed).
    pub(crate) fn abandon(&self, seq: u64) -> bool {
        let mut inner = self.lock("ReadinessState::abandon");
        let outstanding = inner
            .waiter
            .as_ref()
            .is_some_and(|(current, _)| *current == seq);
        if !outstanding || inner.state != LifecycleState::Busy {
            return false;
        }
        inner.waiter = None;
        inner.abandoned = Some(seq);
        self.set_state(&mut inner, LifecycleState::Ready);
        true
    }

    /// Enter ShuttingDown and return the previous state.
    ///
    /// The outstanding waiter, if any, is dropped so its submitter wakes immediately.
    /// Already closed states are left untouched.
    pub(crate) fn begin_shutdown(&self) -> LifecycleState {
        let mut inner = self.lock("ReadinessState::begin_shutdown");
        let previous = inner.state;
        if previous.is_closed() {
            return previous;
        }
        inner.waiter = None;
        inner.pending.clear();
        inner.abandoned = None;
        self.set_state(&mut inner, LifecycleState::ShuttingDown);
        previous
    }

    pub(crate) fn mark_terminated(&self) {
        let mut inner = self.lock("ReadinessState::mark_terminated");
        inner.waiter = None;
        inner.pending.clear();
        self.set_state(&mut inner, LifecycleState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_state() -> ReadinessState {
        let state = ReadinessState::new();
        assert!(state.mark_spawned());
        let first = state.observe_line(">>> ".into(), true);
        assert!(first.first_prompt);
        state
    }

    #[test]
    fn starts_in_starting_and_rejects_as_not_running() {
        let state = ReadinessState::new();
        assert_eq!(state.state(), LifecycleState::Starting);
        assert_eq!(state.try_admit().unwrap_err(), Rejection::NotRunning);
    }

    #[test]
    fn awaiting_first_prompt_rejects_as_not_ready() {
        let state = ReadinessState::new();
        state.mark_spawned();
        assert_eq!(state.try_admit().unwrap_err(), Rejection::NotReady);
    }

    #[test]
    fn banner_before_first_prompt_is_discarded() {
        let state = ReadinessState::new();
        state.mark_spawned();
        state.observe_line("Python 3.12.1".into(), false);
        state.observe_line("Type \"help\" for more information.".into(), false);
        assert_eq!(state.pending_len(), 2);

        state.observe_line(">>> ".into(), true);
        assert_eq!(state.pending_len(), 0);
        assert!(state.state().is_ready());
    }

    #[test]
    fn ready_notification_only_on_first_prompt() {
        let state = ready_state();
        let again = state.observe_line(">>> ".into(), true);
        assert!(!again.first_prompt);
    }

    #[test]
    fn second_admission_while_busy_is_not_ready_and_keeps_buffer() {
        let state = ready_state();
        let (seq, _rx) = state.try_admit().unwrap();
        assert_eq!(seq, 1);
        state.observe_line("partial".into(), false);

        assert_eq!(state.try_admit().unwrap_err(), Rejection::NotReady);
        assert_eq!(state.state(), LifecycleState::Busy);
        assert_eq!(state.pending_len(), 1);
        assert_eq!(state.outstanding_seq(), Some(1));
    }

    #[test]
    fn prompt_completes_outstanding_command_with_buffered_lines() {
        let state = ready_state();
        let (seq, mut rx) = state.try_admit().unwrap();
        state.observe_line("2".into(), false);
        let observed = state.observe_line(">>> ".into(), true);

        assert_eq!(observed.completed, Some(seq));
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.lines, vec!["2".to_string()]);
        assert_eq!(completion.late_output_from, None);
        assert_eq!(state.pending_len(), 0);
        assert!(state.state().is_ready());
    }

    #[test]
    fn repeated_prompts_each_flush_their_own_buffer() {
        let state = ready_state();
        let (_, mut first) = state.try_admit().unwrap();
        state.observe_line("a".into(), false);
        state.observe_line(">>> ".into(), true);

        let (_, mut second) = state.try_admit().unwrap();
        state.observe_line("b".into(), false);
        state.observe_line(">>> ".into(), true);

        assert_eq!(first.try_recv().unwrap().lines, vec!["a".to_string()]);
        assert_eq!(second.try_recv().unwrap().lines, vec!["b".to_string()]);
    }

    #[test]
    fn abandon_resets_to_ready_and_late_prompt_is_attributed() {
        let state = ready_state();
        let (seq, _rx) = state.try_admit().unwrap();
        assert!(state.abandon(seq));
        assert!(state.state().is_ready());
        assert_eq!(state.outstanding_seq(), None);

        state.observe_line("slow result".into(), false);
        let observed = state.observe_line(">>> ".into(), true);
        let late = observed.late.expect("late response for the abandoned command");
        assert_eq!(late.seq, seq);
        assert_eq!(late.lines, vec!["slow result".to_string()]);
    }

    #[test]
    fn completion_after_abandon_is_flagged() {
        let state = ready_state();
        let (first, _rx) = state.try_admit().unwrap();
        state.abandon(first);

        let (_, mut rx) = state.try_admit().unwrap();
        state.observe_line("mixed".into(), false);
        state.observe_line(">>> ".into(), true);

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.late_output_from, Some(first));
    }

    #[test]
    fn abandon_of_stale_sequence_is_ignored() {
        let state = ready_state();
        let (seq, _rx) = state.try_admit().unwrap();
        state.observe_line(">>> ".into(), true);
        assert!(!state.abandon(seq));
        assert!(state.state().is_ready());
    }

    #[test]
    fn pending_buffer_is_capped() {
        let state = ready_state();
        let (_, mut rx) = state.try_admit().unwrap();
        for i in 0..MAX_PENDING_LINES + 5 {
            state.observe_line(i.to_string(), false);
        }
        state.observe_line(">>> ".into(), true);

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.lines.len(), MAX_PENDING_LINES);
        assert_eq!(completion.dropped_lines, 5);
        assert_eq!(completion.lines[0], "5");
    }

    #[test]
    fn begin_shutdown_wakes_waiter_and_is_idempotent() {
        let state = ready_state();
        let (_, mut rx) = state.try_admit().unwrap();

        assert_eq!(state.begin_shutdown(), LifecycleState::Busy);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.try_admit().unwrap_err(), Rejection::NotRunning);

        assert_eq!(state.begin_shutdown(), LifecycleState::ShuttingDown);
        state.mark_terminated();
        assert_eq!(state.begin_shutdown(), LifecycleState::Terminated);
        assert_eq!(state.state(), LifecycleState::Terminated);
    }

    #[test]
    fn lines_after_shutdown_are_ignored() {
        let state = ready_state();
        state.begin_shutdown();
        let observed = state.observe_line(">>> ".into(), true);
        assert!(!observed.first_prompt);
        assert_eq!(state.pending_len(), 0);
        assert_eq!(state.state(), LifecycleState::ShuttingDown);
    }

    #[test]
    fn watch_channel_mirrors_state() {
        let state = ReadinessState::new();
        let rx = state.subscribe();
        state.mark_spawned();
        assert_eq!(*rx.borrow(), LifecycleState::AwaitingFirstPrompt);
        state.observe_line(">>> ".into(), true);
        assert_eq!(*rx.borrow(), LifecycleState::Ready);
    }
}
