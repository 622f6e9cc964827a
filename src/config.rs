//! Configuration loading
//!
//! Resolution order for the config file:
//! 1. Explicit path (command-line argument)
//! 2. `CAMTRAP_CONFIG` environment variable
//! 3. `./camtrap.toml` if present
//! 4. Compiled defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "CAMTRAP_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "camtrap.toml";

/// GMT+8, the deployment default of the survey sheets
pub const DEFAULT_TIMEZONE_MINUTES: i32 = 480;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Offset applied to sheet times when an import doesn't specify one
    pub default_timezone_minutes: i32,

    /// tracing-subscriber filter directive, overridden by RUST_LOG
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: PathBuf::from("camtrap.db"),
            default_timezone_minutes: DEFAULT_TIMEZONE_MINUTES,
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Resolve and load the configuration
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_path(cli_path) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse a TOML config file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    fn resolve_path(cli_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = cli_path {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        local.exists().then_some(local)
    }
}
