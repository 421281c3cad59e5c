//! Built-in REPL profiles.
//!
//! These form the lowest settings layer, so `replbridge` works without any config file.

use super::launch::LineNormalization;
use super::settings::{BridgeSettings, DirectiveSettings, ProfileConfig};
use std::collections::HashMap;

/// Profile used when neither the CLI nor any config layer names one.
pub const DEFAULT_PROFILE: &str = "python";

/// Returns the default BridgeSettings layer.
pub fn default_settings() -> BridgeSettings {
    BridgeSettings {
        default_profile: Some(DEFAULT_PROFILE.to_string()),
        response_timeout_ms: Some(10_000),
        shutdown_grace_ms: Some(3_000),
        profiles: default_profiles(),
        directives: Some(DirectiveSettings {
            clear: Some("clear".to_string()),
            exit: Some(vec!["exit".to_string(), "quit".to_string()]),
        }),
    }
}

fn default_profiles() -> HashMap<String, ProfileConfig> {
    let mut profiles = HashMap::new();

    // -u keeps stdout unbuffered so results are not held back behind the prompt
    profiles.insert(
        "python".to_string(),
        profile("python3", &["-i", "-u"], r"^(>>> |\.\.\. )"),
    );
    profiles.insert("sh".to_string(), profile("sh", &["-i"], r"^[$#] "));
    profiles.insert(
        "node".to_string(),
        profile("node", &["--interactive"], r"^(> |\.\.\. )"),
    );

    profiles
}

fn profile(command: &str, args: &[&str], prompt: &str) -> ProfileConfig {
    ProfileConfig {
        command: Some(command.to_string()),
        args: Some(args.iter().map(|a| a.to_string()).collect()),
        prompt: Some(prompt.to_string()),
        normalization: Some(LineNormalization::Raw),
        partial_prompts: Some(true),
        merge_stderr: Some(true),
    }
}
