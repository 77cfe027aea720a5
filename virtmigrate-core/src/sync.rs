//! File-sync backends
//!
//! Selecting a backend is a pure function of its name; the result is the
//! binary plus argument list that the replication script invokes once per
//! partition.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Supported file-sync tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    #[default]
    Rclone,
    Rsync,
}

/// Tunables passed to a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Compare file checksums instead of size/mtime
    pub checksum: bool,
    /// Parallel checkers (rclone only)
    pub checkers: Option<u32>,
}

/// Binary and arguments for one sync run, without paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInvocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl SyncInvocation {
    /// Render `program args... source destination` as shell text.
    pub fn command_line(&self, source: &str, destination: &str) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 3);
        parts.push(self.program.to_string());
        parts.extend(self.args.iter().cloned());
        parts.push(source.to_string());
        parts.push(destination.to_string());
        parts.join(" ")
    }
}

const RCLONE_DEFAULTS: &[&str] = &[
    "--skip-links",
    "--contimeout",
    "100s",
    "--timeout",
    "300s",
    "--retries",
    "3",
    "--low-level-retries",
    "10",
    "--drive-acknowledge-abuse",
    "--stats",
    "1s",
    "--cutoff-mode=soft",
];

const RCLONE_DEFAULT_CHECKERS: u32 = 8;

impl SyncBackend {
    pub fn name(&self) -> &'static str {
        match self {
            SyncBackend::Rclone => "rclone",
            SyncBackend::Rsync => "rsync",
        }
    }

    pub fn invocation(&self, options: &SyncOptions) -> SyncInvocation {
        match self {
            SyncBackend::Rclone => {
                let mut args = vec!["sync".to_string(), "--progress".to_string()];
                if options.checksum {
                    args.push("--checksum".to_string());
                }
                let checkers = options.checkers.unwrap_or(RCLONE_DEFAULT_CHECKERS);
                args.push("--checkers".to_string());
                args.push(checkers.to_string());
                args.extend(RCLONE_DEFAULTS.iter().map(|a| a.to_string()));
                SyncInvocation {
                    program: "rclone",
                    args,
                }
            }
            SyncBackend::Rsync => {
                let mut args = vec!["-avzP".to_string()];
                if options.checksum {
                    args.push("-c".to_string());
                }
                args.push("--delete".to_string());
                args.push("--timeout=300".to_string());
                args.push("--contimeout=100".to_string());
                SyncInvocation {
                    program: "rsync",
                    args,
                }
            }
        }
    }
}

impl fmt::Display for SyncBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SyncBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "rclone" => Ok(SyncBackend::Rclone),
            "rsync" => Ok(SyncBackend::Rsync),
            other => Err(ConfigError::InvalidSyncTool(other.to_string())),
        }
    }
}
