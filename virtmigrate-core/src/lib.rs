//! virtmigrate core library
//!
//! Building blocks shared by the migration engine and the CLI:
//! - Run configuration and its validation
//! - Replication job sizing from observed disk usage
//! - File-sync backend argument grammars
//! - The external command seam and a scripted test double
//! - Bounded retry with multiplicative backoff

pub mod config;
pub mod error;
pub mod resources;
pub mod retry;
pub mod runner;
pub mod sync;
pub mod version;

pub use config::{ClusterHandle, ConfigError, KubeCli, MigrationConfig, MigrationSettings};
pub use error::{MigrateError, Result, ResultExt};
pub use resources::ResourceProfile;
pub use retry::{retry_until, RetryOutcome, RetryPolicy};
pub use runner::{CommandOptions, CommandRunner, ScriptedRunner, ShellRunner};
pub use sync::{SyncBackend, SyncInvocation, SyncOptions};
pub use version::BuildInfo;

/// Fixed interval between status polls
pub const POLL_INTERVAL_SECS: u64 = 5;

/// Default bound for VM status waits
pub const VM_WAIT_TIMEOUT_SECS: u64 = 5 * 60;
