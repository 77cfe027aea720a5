//! Migrate Command
//!
//! Cuts over from the source VM to the destination VM.

use anyhow::{Context, Result};
use console::style;

use virtmigrate_core::MigrationConfig;
use virtmigrate_engine::MigrationController;

use super::{connect_clusters, engine_error};
use crate::symbols;

/// Run migrate command
pub async fn run(config: MigrationConfig) -> Result<()> {
    let (source, destination) = connect_clusters(&config);
    let controller = MigrationController::new(config, source, destination);

    let summary = controller
        .migrate()
        .await
        .map_err(engine_error)
        .context("Migration failed")?;

    let vm = style(&controller.config().vm_name).cyan();
    if summary.stopped_source {
        println!("{} Source VM {} stopped", style(symbols::CHECK).green(), vm);
    }
    println!("{} Final sync complete", style(symbols::CHECK).green());
    println!(
        "{} Destination VM {} running",
        style(symbols::CHECK).green(),
        vm
    );

    if summary.cleanup.success() {
        println!(
            "{} Removed {} migration resources",
            style(symbols::CHECK).green(),
            summary.cleanup.deleted.len()
        );
    } else {
        println!(
            "{} Cleanup incomplete, remove these by hand:",
            style(symbols::WARN).yellow()
        );
        for error in &summary.cleanup.errors {
            println!("  {}", style(error).dim());
        }
    }

    Ok(())
}
