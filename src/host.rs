//! Registry of bridges running side by side, one per console tab.
//!
//! Each bridge gets an identity `REPL-<n>` from a counter that never reuses numbers, so a
//! closed tab's name is not handed to a new process.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use tokio::task::JoinSet;

use crate::bridge::{Bridge, BridgeOptions, LifecycleState};
use crate::config::LaunchSpec;
use crate::error::{BridgeError, BridgeResult, LockResultExt};

/// What a sidebar may show about a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSummary {
    pub identity: String,
    pub state: LifecycleState,
    pub alive: bool,
}

pub struct BridgeHost {
    bridges: Mutex<Vec<(String, Bridge)>>,
    counter: AtomicUsize,
    options: BridgeOptions,
}

impl Default for BridgeHost {
    fn default() -> Self {
        Self::new(BridgeOptions::default())
    }
}

impl BridgeHost {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            bridges: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(1),
            options,
        }
    }

    fn next_identity(&self) -> String {
        format!("REPL-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a bridge without starting it, so callers can attach callbacks first.
    pub fn create(&self, spec: LaunchSpec) -> Bridge {
        let bridge = Bridge::with_options(self.next_identity(), spec, self.options.clone());
        debug!(
            target: "replbridge::host",
            "Registered {} ({})",
            bridge.identity(),
            bridge.launch_spec().command_line()
        );
        self.bridges
            .lock()
            .recover_poison("BridgeHost::create")
            .push((bridge.identity().to_string(), bridge.clone()));
        bridge
    }

    /// Create and start a bridge. A bridge whose spawn failed stays registered as Terminated.
    pub fn open(&self, spec: LaunchSpec) -> BridgeResult<Bridge> {
        let bridge = self.create(spec);
        bridge.start()?;
        Ok(bridge)
    }

    /// New, unstarted bridge running the same launch spec as `identity`.
    pub fn fork(&self, identity: &str) -> BridgeResult<Bridge> {
        let source = self
            .get(identity)
            .ok_or_else(|| BridgeError::process_not_running(identity))?;
        let bridge = self.create(source.launch_spec().clone());
        info!(
            target: "replbridge::host",
            "Forked {} from {}",
            bridge.identity(),
            identity
        );
        Ok(bridge)
    }

    pub fn get(&self, identity: &str) -> Option<Bridge> {
        self.bridges
            .lock()
            .recover_poison("BridgeHost::get")
            .iter()
            .find(|(id, _)| id == identity)
            .map(|(_, bridge)| bridge.clone())
    }

    /// Identities in creation order.
    pub fn identities(&self) -> Vec<String> {
        self.bridges
            .lock()
            .recover_poison("BridgeHost::identities")
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<BridgeSummary> {
        self.bridges
            .lock()
            .recover_poison("BridgeHost::summaries")
            .iter()
            .map(|(id, bridge)| BridgeSummary {
                identity: id.clone(),
                state: bridge.state(),
                alive: bridge.is_alive(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bridges.lock().recover_poison("BridgeHost::len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut a bridge down and forget it. Returns false if no bridge has that identity.
    pub async fn close(&self, identity: &str) -> bool {
        // Remove under the lock, shut down after releasing it
        let removed = {
            let mut bridges = self.bridges.lock().recover_poison("BridgeHost::close");
            bridges
                .iter()
                .position(|(id, _)| id == identity)
                .map(|index| bridges.remove(index).1)
        };
        match removed {
            Some(bridge) => {
                bridge.shutdown().await;
                info!(target: "replbridge::host", "Closed {}", identity);
                true
            }
            None => false,
        }
    }

    /// Shut every bridge down in parallel and empty the registry.
    pub async fn shutdown_all(&self) {
        let bridges: Vec<(String, Bridge)> = std::mem::take(
            &mut *self.bridges.lock().recover_poison("BridgeHost::shutdown_all"),
        );
        if bridges.is_empty() {
            return;
        }

        let mut join_set = JoinSet::new();
        for (identity, bridge) in bridges {
            join_set.spawn(async move {
                debug!(target: "replbridge::host", "Shutting down {}", identity);
                bridge.shutdown().await;
            });
        }
        Self::drain_join_set(&mut join_set).await;
    }

    async fn drain_join_set(join_set: &mut JoinSet<()>) {
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                warn!(target: "replbridge::host", "Shutdown task panicked: {}", e);
            }
        }
    }
}
