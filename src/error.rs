//! Error handling types for replbridge
//!
//! Every rejected or failed submission maps to a distinct [`BridgeError`] variant so
//! hosts can tell "try again" apart from "this bridge is gone".

use std::path::PathBuf;
use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`Bridge`](crate::Bridge) to its caller.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The executable could not be found or started.
    #[error("{identity}: failed to start '{command}': {reason}")]
    Spawn {
        identity: String,
        command: String,
        reason: String,
    },

    /// A command is already outstanding, or the first prompt has not been seen yet.
    #[error("{identity} not ready for input. Please wait.")]
    NotReady { identity: String },

    /// No prompt boundary arrived within the response timeout.
    #[error("{identity}: no prompt within {timeout:?}")]
    Timeout { identity: String, timeout: Duration },

    /// The bridge was never started, is shutting down, or its process has exited.
    #[error("{identity} process is not running.")]
    ProcessNotRunning { identity: String },

    /// Writing the command to the child's input stream failed.
    #[error("{identity}: failed to write command: {reason}")]
    Write { identity: String, reason: String },

    /// `start()` was called on a bridge that already left the Starting state.
    #[error("{identity} has already been started")]
    AlreadyStarted { identity: String },

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Stable, machine-readable classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Spawn,
    NotReady,
    Timeout,
    ProcessNotRunning,
    Write,
    AlreadyStarted,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Spawn => "spawn_error",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProcessNotRunning => "process_not_running",
            ErrorKind::Write => "write_error",
            ErrorKind::AlreadyStarted => "already_started",
            ErrorKind::Config => "config_error",
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn spawn(
        identity: impl Into<String>,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        BridgeError::Spawn {
            identity: identity.into(),
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn not_ready(identity: impl Into<String>) -> Self {
        BridgeError::NotReady {
            identity: identity.into(),
        }
    }

    pub fn timeout(identity: impl Into<String>, timeout: Duration) -> Self {
        BridgeError::Timeout {
            identity: identity.into(),
            timeout,
        }
    }

    pub fn process_not_running(identity: impl Into<String>) -> Self {
        BridgeError::ProcessNotRunning {
            identity: identity.into(),
        }
    }

    pub fn write(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::Write {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Spawn { .. } => ErrorKind::Spawn,
            BridgeError::NotReady { .. } => ErrorKind::NotReady,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::ProcessNotRunning { .. } => ErrorKind::ProcessNotRunning,
            BridgeError::Write { .. } => ErrorKind::Write,
            BridgeError::AlreadyStarted { .. } => ErrorKind::AlreadyStarted,
            BridgeError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the same bridge can still accept commands after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotReady | ErrorKind::Timeout)
    }

    /// Human-readable guidance for presenting the error to a user.
    pub fn retry_hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotReady => "wait for the prompt, then send the command again",
            ErrorKind::Timeout => {
                "the bridge accepts input again; a late response may still appear in the output"
            }
            ErrorKind::Spawn => "check that the REPL executable is installed and on PATH",
            ErrorKind::ProcessNotRunning | ErrorKind::Write => {
                "this REPL has exited; open a new one to continue"
            }
            ErrorKind::AlreadyStarted => "create a new bridge instead of restarting this one",
            ErrorKind::Config => "fix the configuration and try again",
        }
    }
}

/// Errors raised while loading settings or building a launch spec.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid prompt pattern '{pattern}': {source}")]
    InvalidPrompt {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            message: message.into(),
        }
    }
}

/// Recover the guard from a poisoned std lock, logging which operation hit it.
pub(crate) trait LockResultExt<T> {
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "replbridge::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn messages_name_the_bridge_identity() {
        assert_eq!(
            BridgeError::not_ready("REPL-1").to_string(),
            "REPL-1 not ready for input. Please wait."
        );
        assert_eq!(
            BridgeError::process_not_running("REPL-2").to_string(),
            "REPL-2 process is not running."
        );
        let spawn = BridgeError::spawn("REPL-3", "pythn", "No such file or directory");
        assert!(spawn.to_string().contains("'pythn'"));
    }

    #[test]
    fn every_kind_has_a_distinct_name() {
        let errors = [
            BridgeError::spawn("r", "c", "x"),
            BridgeError::not_ready("r"),
            BridgeError::timeout("r", Duration::from_secs(1)),
            BridgeError::process_not_running("r"),
            BridgeError::write("r", "broken pipe"),
            BridgeError::AlreadyStarted {
                identity: "r".into(),
            },
            BridgeError::Config(ConfigError::invalid("bad")),
        ];
        let mut names: Vec<_> = errors.iter().map(|e| e.kind().as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), errors.len());
    }

    #[test]
    fn only_not_ready_and_timeout_are_recoverable() {
        assert!(BridgeError::not_ready("r").is_recoverable());
        assert!(BridgeError::timeout("r", Duration::from_millis(5)).is_recoverable());
        assert!(!BridgeError::process_not_running("r").is_recoverable());
        assert!(!BridgeError::write("r", "eof").is_recoverable());
        assert!(!BridgeError::spawn("r", "c", "x").is_recoverable());
    }

    #[test]
    fn recover_poison_returns_inner_value() {
        let lock = Arc::new(Mutex::new(7));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        let guard = lock.lock().recover_poison("test");
        assert_eq!(*guard, 7);
    }
}
