pub mod defaults;
pub mod launch;
pub mod settings;
pub mod timeouts;
pub mod user;

pub use launch::{LaunchSpec, LineNormalization, PromptMatcher};
pub use settings::{BridgeSettings, DirectiveSettings, ProfileConfig};
pub use timeouts::{BridgeTimeouts, ResponseTimeout, ShutdownGrace};
pub use user::{load_user_config, user_config_path};

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::bridge::{BridgeOptions, Directives};
use crate::error::ConfigError;

/// File name looked up in the project directory.
pub const PROJECT_CONFIG_FILE: &str = "replbridge.toml";

/// Merge two BridgeSettings, preferring values from `primary` over `fallback`
pub fn merge_settings(
    fallback: Option<BridgeSettings>,
    primary: Option<BridgeSettings>,
) -> Option<BridgeSettings> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(settings), None) => Some(settings),
        (None, Some(settings)) => Some(settings),
        (Some(fallback), Some(primary)) => Some(BridgeSettings {
            default_profile: primary.default_profile.or(fallback.default_profile),
            response_timeout_ms: primary.response_timeout_ms.or(fallback.response_timeout_ms),
            shutdown_grace_ms: primary.shutdown_grace_ms.or(fallback.shutdown_grace_ms),
            profiles: merge_profiles(fallback.profiles, primary.profiles),
            directives: merge_directives(fallback.directives, primary.directives),
        }),
    }
}

/// Merge layers in order; later layers override earlier ones.
pub fn merge_all(layers: &[Option<BridgeSettings>]) -> Option<BridgeSettings> {
    layers
        .iter()
        .cloned()
        .fold(None, |acc, layer| merge_settings(acc, layer))
}

fn merge_profiles(
    mut fallback: HashMap<String, ProfileConfig>,
    primary: HashMap<String, ProfileConfig>,
) -> HashMap<String, ProfileConfig> {
    for (name, primary_profile) in primary {
        let merged = match fallback.remove(&name) {
            Some(fallback_profile) => ProfileConfig {
                command: primary_profile.command.or(fallback_profile.command),
                args: primary_profile.args.or(fallback_profile.args),
                prompt: primary_profile.prompt.or(fallback_profile.prompt),
                normalization: primary_profile
                    .normalization
                    .or(fallback_profile.normalization),
                partial_prompts: primary_profile
                    .partial_prompts
                    .or(fallback_profile.partial_prompts),
                merge_stderr: primary_profile.merge_stderr.or(fallback_profile.merge_stderr),
            },
            None => primary_profile,
        };
        fallback.insert(name, merged);
    }
    fallback
}

fn merge_directives(
    fallback: Option<DirectiveSettings>,
    primary: Option<DirectiveSettings>,
) -> Option<DirectiveSettings> {
    match (fallback, primary) {
        (Some(fallback), Some(primary)) => Some(DirectiveSettings {
            clear: primary.clear.or(fallback.clear),
            exit: primary.exit.or(fallback.exit),
        }),
        (fallback, primary) => primary.or(fallback),
    }
}

/// Read and parse one settings file.
pub fn read_settings_file(path: &Path) -> Result<BridgeSettings, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl BridgeSettings {
    /// Build the launch spec for `name`, or for `defaultProfile` when `name` is None.
    pub fn resolve_profile(&self, name: Option<&str>) -> Result<LaunchSpec, ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or(defaults::DEFAULT_PROFILE);
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))?;

        let command = profile
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ConfigError::invalid(format!("profile '{name}' has no command")))?;
        let pattern = profile
            .prompt
            .as_deref()
            .ok_or_else(|| ConfigError::invalid(format!("profile '{name}' has no prompt")))?;

        let prompt = PromptMatcher::new(pattern)?
            .with_normalization(profile.normalization.unwrap_or_default())
            .with_partial_lines(profile.partial_prompts.unwrap_or(true));

        Ok(LaunchSpec::new(
            command,
            profile.args.clone().unwrap_or_default(),
            prompt,
        )
        .with_merge_stderr(profile.merge_stderr.unwrap_or(true)))
    }

    pub fn timeouts(&self) -> Result<BridgeTimeouts, ConfigError> {
        let response = match self.response_timeout_ms {
            Some(ms) => ResponseTimeout::from_millis(ms)?,
            None => ResponseTimeout::default(),
        };
        let grace = match self.shutdown_grace_ms {
            Some(ms) => ShutdownGrace::from_millis(ms)?,
            None => ShutdownGrace::default(),
        };
        Ok(BridgeTimeouts { response, grace })
    }

    pub fn directives(&self) -> Directives {
        let Some(settings) = &self.directives else {
            return Directives::default();
        };
        let defaults = Directives::default();
        let clear = match &settings.clear {
            Some(clear) if clear.trim().is_empty() => None,
            Some(clear) => Some(clear.clone()),
            None => defaults.clear().map(str::to_string),
        };
        let exit = settings
            .exit
            .clone()
            .unwrap_or_else(|| defaults.exit().to_vec());
        Directives::new(clear, exit)
    }

    pub fn bridge_options(&self) -> Result<BridgeOptions, ConfigError> {
        Ok(BridgeOptions {
            timeouts: self.timeouts()?,
            directives: self.directives(),
        })
    }

    /// Profile names in sorted order.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsEventKind {
    Info,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsEvent {
    pub kind: SettingsEventKind,
    pub message: String,
}

impl SettingsEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Warning,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct SettingsLoadOutcome {
    pub settings: BridgeSettings,
    pub events: Vec<SettingsEvent>,
}

/// Load settings from every layer.
///
/// Layers, lowest precedence first: built-in defaults, user config, project config
/// (`<project_root>/replbridge.toml`), then `explicit_path`. A layer that fails to load
/// is skipped with a warning event; loading itself never fails.
pub fn load_settings(project_root: Option<&Path>, explicit_path: Option<&Path>) -> SettingsLoadOutcome {
    let mut events = Vec::new();

    let defaults = Some(defaults::default_settings());

    let user_config = match load_user_config() {
        Ok(Some(settings)) => {
            events.push(SettingsEvent::info("Loaded user config"));
            Some(settings)
        }
        Ok(None) => None,
        Err(err) => {
            events.push(SettingsEvent::warning(format!(
                "Failed to load user config: {}",
                err
            )));
            None
        }
    };

    let project_settings = project_root
        .map(|root| root.join(PROJECT_CONFIG_FILE))
        .filter(|path| path.exists())
        .and_then(|path| load_layer(&path, &mut events));

    let explicit_settings = explicit_path.and_then(|path| load_layer(path, &mut events));

    let settings = merge_all(&[defaults, user_config, project_settings, explicit_settings])
        .unwrap_or_else(defaults::default_settings);

    SettingsLoadOutcome { settings, events }
}

fn load_layer(path: &Path, events: &mut Vec<SettingsEvent>) -> Option<BridgeSettings> {
    match read_settings_file(path) {
        Ok(settings) => {
            events.push(SettingsEvent::info(format!(
                "Loaded config file: {}",
                path.display()
            )));
            Some(settings)
        }
        Err(err) => {
            events.push(SettingsEvent::warning(err.to_string()));
            None
        }
    }
}
