use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const SETTINGS_FILE: &str = ".pcconvert.yaml";

/// Optional defaults read from `.pcconvert.yaml`. Command line flags win over these.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Write the text variants of PLY and PCD.
    pub text_encoding: bool,
    /// PotreeConverter executable, or a directory to search for it.
    pub potree_converter: Option<PathBuf>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }

    /// Settings from the first file found in the working directory or the home directory.
    /// A broken file is ignored with a warning.
    pub fn load() -> Self {
        let candidates = std::env::current_dir()
            .ok()
            .into_iter()
            .chain(dirs::home_dir())
            .map(|dir| dir.join(SETTINGS_FILE));
        for path in candidates {
            if !path.is_file() {
                continue;
            }
            return match Settings::from_file(&path) {
                Ok(settings) => {
                    log::debug!("loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("ignoring settings file: {:#}", e);
                    Settings::default()
                }
            };
        }
        Settings::default()
    }
}
