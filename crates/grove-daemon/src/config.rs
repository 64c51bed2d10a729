//! Daemon configuration: directories and the settings file.

use async_trait::async_trait;
use grove_core::credentials::{self, CredentialError, Settings, SettingsStore};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const SETTINGS_FILE: &str = "settings.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot determine home directory; pass --workdir")]
    NoHomeDir,

    #[error("Cannot determine config directory; pass --config-dir")]
    NoConfigDir,

    #[error("Failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Resolved directories.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all materialised grovebooks
    pub workdir: PathBuf,
    /// Settings and credential vault
    pub config_dir: PathBuf,
}

impl Config {
    /// Resolve directories from optional overrides, falling back to the
    /// platform defaults (`~/.grovebook`, `<config dir>/grovebook`).
    pub fn resolve(workdir: Option<&str>, config_dir: Option<&str>) -> Result<Self, ConfigError> {
        let workdir = match workdir {
            Some(path) => expand_tilde(path),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(".grovebook"),
        };
        let config_dir = match config_dir {
            Some(path) => expand_tilde(path),
            None => dirs::config_dir()
                .ok_or(ConfigError::NoConfigDir)?
                .join("grovebook"),
        };
        Ok(Self {
            workdir,
            config_dir,
        })
    }

    /// Create both directories if missing.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [&self.workdir, &self.config_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir.join(CREDENTIALS_FILE)
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

/// Settings stored as `settings.json`. A missing file reads as defaults.
pub struct JsonSettings {
    path: PathBuf,
}

impl JsonSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for JsonSettings {
    async fn load(&self) -> credentials::Result<Settings> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {:?}, using defaults", self.path);
                return Ok(Settings::default());
            }
            Err(e) => return Err(CredentialError::Settings(e.to_string())),
        };
        serde_json::from_str(&contents)
            .map_err(|e| CredentialError::Settings(format!("{:?}: {}", self.path, e)))
    }

    async fn save(&self, settings: &Settings) -> credentials::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CredentialError::Settings(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(settings)
            .map_err(|e| CredentialError::Settings(e.to_string()))?;
        fs::write(&self.path, contents)
            .await
            .map_err(|e| CredentialError::Settings(e.to_string()))
    }
}
