//! Lifecycle controller: ordered, idempotent teardown of a bridge.
//!
//! Shutdown steps, each attempted regardless of how the previous one went:
//! 1. Enter ShuttingDown so the gate refuses new commands
//! 2. Cancel and join the drain task
//! 3. Close the child's stdin
//! 4. Request graceful exit and wait for the grace period
//! 5. Force kill if the child is still alive
//! 6. Enter Terminated and deliver the termination event

use std::time::Duration;

use log::{debug, info, warn};

use super::events::{Termination, TerminationReason};
use super::{Bridge, BridgeCore};
use crate::error::LockResultExt;

/// How long to wait for the exit to be observed after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Extra time granted to a drain task that is busy running its own teardown.
const DRAIN_JOIN_SLACK: Duration = Duration::from_millis(500);

/// Upper bound on [`BridgeCore::teardown`]: closing stdin and the graceful exit wait
/// each take up to `grace`, then the kill wait.
fn teardown_limit(grace: Duration) -> Duration {
    grace * 2 + KILL_WAIT
}

/// How long `shutdown()` waits for the drain task.
///
/// A drain task that already hit end of stream is running its own teardown, which must
/// be allowed to finish so its termination reason is the one reported.
fn drain_join_limit(grace: Duration) -> Duration {
    teardown_limit(grace) + DRAIN_JOIN_SLACK
}

impl Bridge {
    /// Shut the bridge down. Safe to call from any state and any number of times.
    pub async fn shutdown(&self) {
        let _serialized = self.inner.shutdown_lock.lock().await;
        let core = &self.inner.core;

        let previous = core.readiness().begin_shutdown();
        if previous == super::LifecycleState::Terminated {
            debug!(
                target: "replbridge::lifecycle",
                "{}: already terminated, nothing to shut down",
                core.identity()
            );
            return;
        }
        info!(
            target: "replbridge::lifecycle",
            "{}: shutting down (was {})",
            core.identity(),
            previous
        );

        let drain = self
            .inner
            .drain
            .lock()
            .recover_poison("Bridge::shutdown")
            .take();
        if let Some(drain) = drain {
            drain.cancel();
            let limit = drain_join_limit(core.timeouts().grace.as_duration());
            if !drain.join(limit).await {
                warn!(
                    target: "replbridge::lifecycle",
                    "{}: drain task did not stop within {:?}; aborted",
                    core.identity(),
                    limit
                );
            }
        }

        core.teardown().await;
        core.notify_terminated(TerminationReason::Shutdown);
    }
}

impl BridgeCore {
    /// Termination path taken from inside the bridge (end of stream, transport failure).
    ///
    /// Does nothing if a shutdown is already under way.
    pub(crate) async fn finish(&self, reason: TerminationReason) {
        let previous = self.readiness().begin_shutdown();
        if previous.is_closed() {
            debug!(
                target: "replbridge::lifecycle",
                "{}: already {}, ignoring {}",
                self.identity(),
                previous,
                reason
            );
            return;
        }
        info!(
            target: "replbridge::lifecycle",
            "{}: terminating ({})",
            self.identity(),
            reason
        );
        self.teardown().await;
        self.notify_terminated(reason);
    }

    /// Steps 3 to 6. Idempotent.
    pub(crate) async fn teardown(&self) {
        if let Some(session) = self.session() {
            let grace = self.timeouts().grace.as_duration();

            if !session.input.close(grace).await {
                warn!(
                    target: "replbridge::lifecycle",
                    "{}: stdin still in use after {:?}; continuing without closing it",
                    self.identity(),
                    grace
                );
            }

            if session.supervisor.is_alive() {
                if let Err(e) = session.supervisor.terminate(true) {
                    warn!(
                        target: "replbridge::lifecycle",
                        "{}: graceful termination request failed: {}",
                        self.identity(),
                        e
                    );
                }
                if !session.supervisor.wait_for_exit(grace).await {
                    debug!(
                        target: "replbridge::lifecycle",
                        "{}: still alive after {:?}; killing",
                        self.identity(),
                        grace
                    );
                    if let Err(e) = session.supervisor.terminate(false) {
                        warn!(
                            target: "replbridge::lifecycle",
                            "{}: kill failed: {}",
                            self.identity(),
                            e
                        );
                    }
                    if !session.supervisor.wait_for_exit(KILL_WAIT).await {
                        warn!(
                            target: "replbridge::lifecycle",
                            "{}: process {:?} did not exit after kill",
                            self.identity(),
                            session.supervisor.pid()
                        );
                    }
                }
            }
        }

        self.readiness().mark_terminated();
    }

    pub(crate) fn notify_terminated(&self, reason: TerminationReason) {
        let termination = Termination {
            identity: self.identity().to_string(),
            reason,
            exit_status: self.session().and_then(|s| s.supervisor.exit_status()),
        };
        if self.events().emit_terminated(&termination) {
            info!(target: "replbridge::lifecycle", "{}", termination);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::ZERO)]
    #[case(Duration::from_millis(300))]
    #[case(Duration::from_secs(3))]
    #[case(Duration::from_secs(60))]
    fn drain_join_outlasts_a_full_teardown(#[case] grace: Duration) {
        // stdin close, graceful wait, kill wait
        let worst_case = grace + grace + KILL_WAIT;
        assert!(drain_join_limit(grace) > worst_case);
    }
}
