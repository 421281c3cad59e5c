//! User configuration loading for replbridge.
//!
//! User config location: $XDG_CONFIG_HOME/replbridge/replbridge.toml
//! Fallback: the platform config directory reported by `dirs` (e.g. ~/.config on Linux)

use std::path::PathBuf;

use super::read_settings_file;
use super::settings::BridgeSettings;
use crate::error::ConfigError;

const APP_DIR: &str = "replbridge";
const CONFIG_FILE: &str = "replbridge.toml";

/// Returns the path to the user configuration file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set and non-empty: $XDG_CONFIG_HOME/replbridge/replbridge.toml
/// 2. Otherwise: `dirs::config_dir()`/replbridge/replbridge.toml
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    Some(base.join(APP_DIR).join(CONFIG_FILE))
}

/// Load the user configuration file, if one exists.
///
/// A missing file is `Ok(None)`; an unreadable or malformed one is an error.
pub fn load_user_config() -> Result<Option<BridgeSettings>, ConfigError> {
    let Some(path) = user_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    read_settings_file(&path).map(Some)
}
