//! Shared fixtures: small `sh` scripts that behave like a REPL.
//!
//! Every fake prints `> ` without a newline as its prompt, the way real interpreters do.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use replbridge::{
    Bridge, BridgeOptions, BridgeTimeouts, Directives, LaunchSpec, PromptMatcher,
    ResponseTimeout, ShutdownGrace,
};

/// Echoes each line back as `got:<line>`, with a few commands that misbehave on purpose.
pub const ECHO_REPL: &str = r#"printf '> '
while IFS= read -r line; do
  case "$line" in
    slow) sleep 1; echo done-slow ;;
    err) echo oops >&2 ;;
    multi) echo one; echo two; echo three ;;
    silent) ;;
    bye) exit 0 ;;
    *) echo "got:$line" ;;
  esac
  printf '> '
done"#;

/// Ignores SIGTERM and stdin, so only a forced kill ends it.
pub const STUBBORN_REPL: &str = "trap '' TERM; printf '> '; exec sleep 30";

/// Takes a while before showing its first prompt.
pub const SLOW_START_REPL: &str = "sleep 1; printf '> '; exec cat";

pub const READY_LIMIT: Duration = Duration::from_secs(5);

pub fn fake_repl(script: &str) -> LaunchSpec {
    LaunchSpec::new("sh", ["-c", script], PromptMatcher::new("^> $").unwrap())
}

pub fn options(response_ms: u64, grace_ms: u64) -> BridgeOptions {
    BridgeOptions {
        timeouts: BridgeTimeouts {
            response: ResponseTimeout::from_millis(response_ms).unwrap(),
            grace: ShutdownGrace::from_millis(grace_ms).unwrap(),
        },
        directives: Directives::default(),
    }
}

/// Start `script` and wait for its first prompt.
pub async fn ready_bridge(script: &str, options: BridgeOptions) -> Bridge {
    let bridge = Bridge::with_options("REPL-T", fake_repl(script), options);
    bridge.start().unwrap();
    bridge.wait_ready(READY_LIMIT).await.unwrap();
    bridge
}

/// Collects every value a callback receives.
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn push(&self, value: T) {
        self.seen.lock().unwrap().push(value);
    }

    pub fn take(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Poll until at least `count` values arrived or `limit` elapsed.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.len() >= count
    }
}
