//! replbridge: drive interactive prompt-based programs (REPLs) as request/response services.
//!
//! A [`Bridge`] owns one child process, reads its merged output in the background and
//! turns "text up to the next prompt" into the response of the last submitted command.
//! [`BridgeHost`] keeps several bridges side by side.
//!
//! Prompt detection is a heuristic: a REPL may print text that happens to match the
//! prompt pattern, and the bridge will treat it as a prompt.

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod introspect;

pub use bridge::{
    Bridge, BridgeOptions, Directives, LateResponse, LifecycleState, OutputLine, Reply, Response,
    Termination, TerminationReason,
};
pub use config::{
    BridgeSettings, BridgeTimeouts, LaunchSpec, LineNormalization, PromptMatcher,
    ResponseTimeout, ShutdownGrace,
};
pub use error::{BridgeError, BridgeResult, ConfigError, ErrorKind};
pub use host::{BridgeHost, BridgeSummary};
