use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::launch::LineNormalization;

/// Top-level contents of a `replbridge.toml` file.
///
/// Every field is optional so that layers can be merged; see [`merge_settings`](super::merge_settings).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directives: Option<DirectiveSettings>,
}

/// One named REPL launch recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<LineNormalization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_prompts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_stderr: Option<bool>,
}

/// Inputs handled locally instead of being sent to the child.
///
/// An empty `clear` string disables the clear-screen directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<Vec<String>>,
}
