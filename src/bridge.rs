//! Interactive process bridge
//!
//! A [`Bridge`] drives one prompt-based child process (a REPL) as if it were a
//! request/response service. The child's output is an unframed text stream; a caller
//! supplied prompt pattern is what separates "response to command N" from "still working".
//!
//! # Module Structure
//!
//! - `supervisor` - spawns and signals the child, owns its stdin
//! - `drain` - background task reading output and detecting prompts
//! - `state` - lifecycle state, pending response buffer, outstanding command
//! - `gate` - `submit()`, local directives, response timeout
//! - `lifecycle` - ordered, idempotent shutdown
//! - `events` - caller callbacks

mod drain;
mod events;
mod gate;
mod lifecycle;
mod state;
mod supervisor;

use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;

pub use events::{LateResponse, OutputLine, Termination, TerminationReason};
pub use gate::{Directives, Reply, Response};
pub use state::LifecycleState;

use drain::{DrainTaskHandle, spawn_drain_task};
use events::EventSink;
use state::ReadinessState;
use supervisor::{InputSink, ProcessSupervisor, SpawnedProcess};

use crate::config::{BridgeTimeouts, LaunchSpec};
use crate::error::{BridgeError, BridgeResult, LockResultExt};

/// Per-bridge tunables that are not part of the launch spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeOptions {
    pub timeouts: BridgeTimeouts,
    pub directives: Directives,
}

/// Process handles that exist once `start()` succeeded.
pub(crate) struct Session {
    pub(crate) supervisor: ProcessSupervisor,
    pub(crate) input: InputSink,
}

/// State shared between the bridge handle and its drain task.
///
/// Deliberately holds no task handles, so the drain task keeping it alive never keeps
/// the bridge itself alive.
pub(crate) struct BridgeCore {
    identity: String,
    readiness: ReadinessState,
    events: EventSink,
    session: OnceLock<Session>,
    timeouts: BridgeTimeouts,
}

impl BridgeCore {
    pub(crate) fn new(identity: impl Into<String>, timeouts: BridgeTimeouts) -> Self {
        Self {
            identity: identity.into(),
            readiness: ReadinessState::new(),
            events: EventSink::default(),
            session: OnceLock::new(),
            timeouts,
        }
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn readiness(&self) -> &ReadinessState {
        &self.readiness
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    pub(crate) fn session(&self) -> Option<&Session> {
        self.session.get()
    }

    pub(crate) fn timeouts(&self) -> &BridgeTimeouts {
        &self.timeouts
    }
}

/// Handle to one REPL child process. Cheap to clone; clones share the same process.
///
/// Register callbacks before [`start`](Self::start) to observe every output line.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    spec: LaunchSpec,
    directives: Directives,
    core: Arc<BridgeCore>,
    started: AtomicBool,
    drain: Mutex<Option<DrainTaskHandle>>,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        // The drain handle cancels its task when dropped; the child must not outlive us
        if let Some(session) = self.core.session()
            && session.supervisor.is_alive()
        {
            debug!(
                target: "replbridge::lifecycle",
                "{}: dropped without shutdown; killing process",
                self.core.identity()
            );
            let _ = session.supervisor.terminate(false);
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("identity", &self.identity())
            .field("command", &self.inner.spec.command_line())
            .field("state", &self.state())
            .finish()
    }
}

impl Bridge {
    pub fn new(identity: impl Into<String>, spec: LaunchSpec) -> Self {
        Self::with_options(identity, spec, BridgeOptions::default())
    }

    pub fn with_options(identity: impl Into<String>, spec: LaunchSpec, options: BridgeOptions) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                spec,
                directives: options.directives,
                core: Arc::new(BridgeCore::new(identity, options.timeouts)),
                started: AtomicBool::new(false),
                drain: Mutex::new(None),
                shutdown_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        self.inner.core.identity()
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.inner.spec
    }

    pub fn timeouts(&self) -> &BridgeTimeouts {
        self.inner.core.timeouts()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.core.readiness().state()
    }

    /// True exactly when the bridge is idle at a prompt.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Whether the child process is running. Never blocks.
    pub fn is_alive(&self) -> bool {
        self.inner
            .core
            .session()
            .is_some_and(|session| session.supervisor.is_alive())
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.core.session().and_then(|s| s.supervisor.pid())
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner
            .core
            .session()
            .and_then(|s| s.supervisor.exit_status())
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.core.readiness().subscribe()
    }

    pub fn on_output_line(&self, listener: impl Fn(&OutputLine) + Send + Sync + 'static) {
        self.inner.core.events().on_output_line(Arc::new(listener));
    }

    /// Called once, when the first prompt is seen.
    pub fn on_ready(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.core.events().on_ready(Arc::new(listener));
    }

    pub fn on_late_response(&self, listener: impl Fn(&LateResponse) + Send + Sync + 'static) {
        self.inner.core.events().on_late_response(Arc::new(listener));
    }

    pub fn on_clear_screen(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.core.events().on_clear_screen(Arc::new(listener));
    }

    /// Called exactly once, whatever ended the bridge.
    pub fn on_terminated(&self, listener: impl Fn(&Termination) + Send + Sync + 'static) {
        self.inner.core.events().on_terminated(Arc::new(listener));
    }

    /// Spawn the child and start draining its output.
    ///
    /// Must be called from within a tokio runtime. A spawn failure is final: the bridge
    /// moves to Terminated and delivers its termination event.
    pub fn start(&self) -> BridgeResult<()> {
        let core = &self.inner.core;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::AlreadyStarted {
                identity: core.identity().to_string(),
            });
        }

        if core.readiness().state().is_closed() {
            return Err(BridgeError::process_not_running(core.identity()));
        }

        let spec = &self.inner.spec;
        info!(
            target: "replbridge::supervisor",
            "Starting {}: {}",
            core.identity(),
            spec.command_line()
        );

        let SpawnedProcess {
            supervisor,
            input,
            output,
        } = match ProcessSupervisor::spawn(spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                core.readiness().begin_shutdown();
                core.readiness().mark_terminated();
                core.notify_terminated(TerminationReason::SpawnFailed(e.to_string()));
                return Err(BridgeError::spawn(
                    core.identity(),
                    spec.command(),
                    e.to_string(),
                ));
            }
        };

        if core.session.set(Session { supervisor, input }).is_err() {
            return Err(BridgeError::AlreadyStarted {
                identity: core.identity().to_string(),
            });
        }
        if !core.readiness().mark_spawned() {
            // shutdown() ran before the process existed, so nothing else will stop it
            if let Some(session) = core.session() {
                let _ = session.supervisor.terminate(false);
            }
            return Err(BridgeError::process_not_running(core.identity()));
        }

        let drain = spawn_drain_task(output, spec.prompt().clone(), Arc::clone(core));
        *self.inner.drain.lock().recover_poison("Bridge::start") = Some(drain);
        Ok(())
    }

    /// Wait until the bridge is idle at a prompt.
    ///
    /// Fails with `ProcessNotRunning` if the bridge closes first, or `Timeout` after `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> BridgeResult<()> {
        let mut rx = self.subscribe_state();
        let outcome = tokio::time::timeout(
            limit,
            rx.wait_for(|state| state.is_ready() || state.is_closed()),
        )
        .await
        .map(|seen| seen.map(|state| *state));

        match outcome {
            Ok(Ok(state)) if state.is_ready() => Ok(()),
            Ok(_) => Err(BridgeError::process_not_running(self.identity())),
            Err(_) => Err(BridgeError::timeout(self.identity(), limit)),
        }
    }

    /// Wait until the bridge reaches Terminated.
    pub async fn wait_terminated(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx
            .wait_for(|state| *state == LifecycleState::Terminated)
            .await;
    }
}
