//! Migration configuration
//!
//! A [`MigrationConfig`] is built once at process start from layered
//! [`MigrationSettings`] (CLI flags, environment, config file, defaults),
//! validated, and then passed by reference to every component.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::SyncBackend;

/// Default SSH port exposed by the destination replicator
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default replication schedule: every 15 minutes
pub const DEFAULT_SCHEDULE: &str = "*/15 * * * *";

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("kubecli must be 'oc' or 'kubectl', got '{0}'")]
    InvalidKubeCli(String),

    #[error("sync-tool must be 'rclone' or 'rsync', got '{0}'")]
    InvalidSyncTool(String),

    #[error(
        "invalid cron schedule format: {0}. Must be in cron format with 5 fields (e.g. '*/15 * * * *')"
    )]
    InvalidSchedule(String),

    #[error("ssh-port must be between 1 and 65535")]
    InvalidPort,
}

/// Cluster command-line flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KubeCli {
    /// OpenShift client
    #[default]
    Oc,
    /// Upstream Kubernetes client
    Kubectl,
}

impl KubeCli {
    /// Binary invoked for this flavor
    pub fn binary(&self) -> &'static str {
        match self {
            KubeCli::Oc => "oc",
            KubeCli::Kubectl => "kubectl",
        }
    }
}

impl fmt::Display for KubeCli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for KubeCli {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "oc" => Ok(KubeCli::Oc),
            "kubectl" => Ok(KubeCli::Kubectl),
            other => Err(ConfigError::InvalidKubeCli(other.to_string())),
        }
    }
}

/// CLI flavor plus credential file for one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    pub cli: KubeCli,
    pub kubeconfig: PathBuf,
}

impl ClusterHandle {
    pub fn new(cli: KubeCli, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            cli,
            kubeconfig: kubeconfig.into(),
        }
    }
}

/// Immutable per-run configuration
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub vm_name: String,
    pub namespace: String,
    pub source: ClusterHandle,
    pub destination: ClusterHandle,
    pub ssh_port: u16,
    pub sync_backend: SyncBackend,
    pub schedule: String,
    pub preserve_ip: bool,
    pub dry_run: bool,
    /// Directory with manifest templates overriding the embedded set
    pub templates_dir: Option<PathBuf>,
}

impl MigrationConfig {
    /// Check required fields and value shapes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vm_name.trim().is_empty() {
            return Err(ConfigError::MissingField("vm-name"));
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::MissingField("namespace"));
        }
        if self.source.kubeconfig.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("src-kubeconfig"));
        }
        if self.destination.kubeconfig.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("dst-kubeconfig"));
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        validate_schedule(&self.schedule)
    }
}

/// Accepts exactly five whitespace-separated fields with no surrounding
/// whitespace, e.g. `*/15 * * * *`.
pub fn validate_schedule(schedule: &str) -> Result<(), ConfigError> {
    let trimmed = schedule.trim();
    if trimmed.len() != schedule.len() || trimmed.split_whitespace().count() != 5 {
        return Err(ConfigError::InvalidSchedule(schedule.to_string()));
    }
    Ok(())
}

/// Layered, not-yet-validated settings
///
/// Every field is optional so layers can be merged before defaults apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MigrationSettings {
    pub vm_name: Option<String>,
    pub namespace: Option<String>,
    pub src_kubeconfig: Option<PathBuf>,
    pub dst_kubeconfig: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub kubecli: Option<String>,
    pub sync_tool: Option<String>,
    pub replication_schedule: Option<String>,
    pub preserve_pod_ip: Option<bool>,
    pub dry_run: Option<bool>,
    pub templates_dir: Option<PathBuf>,
}

impl MigrationSettings {
    /// Fill unset fields from a lower-precedence layer.
    pub fn or(self, lower: MigrationSettings) -> Self {
        Self {
            vm_name: self.vm_name.or(lower.vm_name),
            namespace: self.namespace.or(lower.namespace),
            src_kubeconfig: self.src_kubeconfig.or(lower.src_kubeconfig),
            dst_kubeconfig: self.dst_kubeconfig.or(lower.dst_kubeconfig),
            ssh_port: self.ssh_port.or(lower.ssh_port),
            kubecli: self.kubecli.or(lower.kubecli),
            sync_tool: self.sync_tool.or(lower.sync_tool),
            replication_schedule: self.replication_schedule.or(lower.replication_schedule),
            preserve_pod_ip: self.preserve_pod_ip.or(lower.preserve_pod_ip),
            dry_run: self.dry_run.or(lower.dry_run),
            templates_dir: self.templates_dir.or(lower.templates_dir),
        }
    }

    /// Apply defaults, parse the closed enumerations and validate.
    pub fn into_config(self) -> Result<MigrationConfig, ConfigError> {
        let cli = match self.kubecli.as_deref() {
            Some(value) => value.parse()?,
            None => KubeCli::default(),
        };
        let sync_backend = match self.sync_tool.as_deref() {
            Some(value) => value.parse()?,
            None => SyncBackend::default(),
        };

        let config = MigrationConfig {
            vm_name: self.vm_name.unwrap_or_default(),
            namespace: self.namespace.unwrap_or_default(),
            source: ClusterHandle::new(cli, self.src_kubeconfig.unwrap_or_default()),
            destination: ClusterHandle::new(cli, self.dst_kubeconfig.unwrap_or_default()),
            ssh_port: self.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
            sync_backend,
            schedule: self
                .replication_schedule
                .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string()),
            preserve_ip: self.preserve_pod_ip.unwrap_or(false),
            dry_run: self.dry_run.unwrap_or(false),
            templates_dir: self.templates_dir,
        };
        config.validate()?;
        Ok(config)
    }
}
