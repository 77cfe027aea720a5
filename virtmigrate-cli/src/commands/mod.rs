//! CLI Commands

use std::sync::Arc;

use anyhow::anyhow;

use virtmigrate_core::{CommandRunner, MigrateError, MigrationConfig, ShellRunner};
use virtmigrate_engine::{connect, ClusterClient};

pub mod check;
pub mod init;
pub mod migrate;
pub mod version;

pub use check::run as check;
pub use init::run as init;
pub use migrate::run as migrate;
pub use version::run as version;

/// Source and destination clients for a run
pub(crate) fn connect_clusters(
    config: &MigrationConfig,
) -> (Arc<dyn ClusterClient>, Arc<dyn ClusterClient>) {
    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
    (
        connect(&config.source, runner.clone()),
        connect(&config.destination, runner),
    )
}

/// Engine errors already carry their context chain in Display.
pub(crate) fn engine_error(err: MigrateError) -> anyhow::Error {
    anyhow!("{}", err)
}
