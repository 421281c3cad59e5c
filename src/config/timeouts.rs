//! Validated timeout types for the command gate and the lifecycle controller.

use std::time::Duration;

use crate::error::ConfigError;

/// How long a submitted command may take before the gate reports a timeout.
///
/// The bound covers writing the command and waiting for the next prompt boundary.
///
/// # Valid Range
///
/// - Minimum: 10 milliseconds (anything shorter cannot survive a scheduler hiccup)
/// - Maximum: 600 seconds
/// - Default: 10 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTimeout(Duration);

impl ResponseTimeout {
    /// Default timeout: 10 seconds
    const DEFAULT_SECS: u64 = 10;

    const MIN: Duration = Duration::from_millis(10);

    const MAX: Duration = Duration::from_secs(600);

    /// Create a new ResponseTimeout with validation.
    ///
    /// Both bounds are inclusive.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration < Self::MIN {
            return Err(ConfigError::invalid(format!(
                "Response timeout must be at least {:?}, got {:?}",
                Self::MIN,
                duration
            )));
        }
        if duration > Self::MAX {
            return Err(ConfigError::invalid(format!(
                "Response timeout must be at most {:?}, got {:?}",
                Self::MAX,
                duration
            )));
        }
        Ok(Self(duration))
    }

    pub fn from_millis(millis: u64) -> Result<Self, ConfigError> {
        Self::new(Duration::from_millis(millis))
    }

    /// Get the inner Duration value.
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ResponseTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(Self::DEFAULT_SECS))
    }
}

/// Grace period between the graceful termination request and the forced kill.
///
/// Zero is allowed and means "escalate immediately".
///
/// # Valid Range
///
/// - Minimum: 0 seconds
/// - Maximum: 60 seconds
/// - Default: 3 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownGrace(Duration);

impl ShutdownGrace {
    /// Default grace period: 3 seconds
    const DEFAULT_SECS: u64 = 3;

    const MAX_SECS: u64 = 60;

    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        let max = Duration::from_secs(Self::MAX_SECS);
        if duration > max {
            return Err(ConfigError::invalid(format!(
                "Shutdown grace period must be at most {}s, got {:?}",
                Self::MAX_SECS,
                duration
            )));
        }
        Ok(Self(duration))
    }

    pub fn from_millis(millis: u64) -> Result<Self, ConfigError> {
        Self::new(Duration::from_millis(millis))
    }

    /// Get the inner Duration value.
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ShutdownGrace {
    fn default() -> Self {
        Self(Duration::from_secs(Self::DEFAULT_SECS))
    }
}

/// The pair of bounds every bridge runs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeTimeouts {
    pub response: ResponseTimeout,
    pub grace: ShutdownGrace,
}
