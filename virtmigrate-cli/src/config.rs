//! Configuration file handling
//!
//! Config file: ~/.virtmigrate/config.toml (or `--config <path>`).
//! Keys use the flag spelling:
//!
//! ```toml
//! log-level = "debug"
//! vm-name = "fedora"
//! namespace = "vms"
//! src-kubeconfig = "/etc/virtmigrate/src.kubeconfig"
//! dst-kubeconfig = "/etc/virtmigrate/dst.kubeconfig"
//! sync-tool = "rsync"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use virtmigrate_core::{MigrationConfig, MigrationSettings};

/// Contents of the config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigFile {
    pub log_level: Option<String>,

    #[serde(flatten)]
    pub migration: MigrationSettings,
}

/// Get the config directory path (~/.virtmigrate/)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".virtmigrate"))
}

/// Get the default config file path
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Parse config file contents
pub fn parse_config(content: &str) -> Result<ConfigFile> {
    toml::from_str(content).context("Failed to parse config file")
}

/// Load the config file.
///
/// An explicit path must exist. Without one, the default path is read
/// when present and an empty config is used otherwise.
pub fn load_config(explicit: Option<&Path>) -> Result<ConfigFile> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_file_path() {
            Ok(path) if path.exists() => path,
            _ => return Ok(ConfigFile::default()),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Merge flag values over the file and validate the result.
pub fn resolve(flags: MigrationSettings, file: &ConfigFile) -> Result<MigrationConfig> {
    flags
        .or(file.migration.clone())
        .into_config()
        .context("Invalid configuration")
}
