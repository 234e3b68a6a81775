//! Settings loader for `config.toml`

use super::types::Settings;
use dumpscope_core::prelude::*;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "dumpscope";
const CONFIG_FILENAME: &str = "config.toml";

/// `<platform config dir>/dumpscope/config.toml`, if the platform has one
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
}

/// Load settings from `path`
///
/// Returns default settings if the file doesn't exist, can't be parsed or
/// fails validation.
pub fn load_settings(path: &Path) -> Settings {
    if !path.exists() {
        debug!("No config file at {:?}, using defaults", path);
        return Settings::default();
    }

    let settings: Settings = match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to parse {:?}: {}", path, e);
                return Settings::default();
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", path, e);
            return Settings::default();
        }
    };

    match settings.validate() {
        Ok(()) => {
            debug!("Loaded settings from {:?}", path);
            settings
        }
        Err(e) => {
            warn!("Ignoring {:?}: {}", path, e);
            Settings::default()
        }
    }
}

/// Load from an explicit path, or the default location when `None`
pub fn load_settings_or_default(path: Option<&Path>) -> Settings {
    match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => load_settings(&path),
        None => Settings::default(),
    }
}

/// Write `settings` to `path`, creating parent directories.
///
/// Writes a temp file next to the target and renames it into place.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::config(format!("Failed to create {:?}: {}", parent, e)))?;
    }

    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)
        .map_err(|e| Error::config(format!("Failed to write temp file: {}", e)))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| Error::config(format!("Failed to rename temp file: {}", e)))?;

    info!("Saved settings to {:?}", path);
    Ok(())
}
