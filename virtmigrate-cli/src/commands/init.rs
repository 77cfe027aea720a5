//! Init Command
//!
//! Creates the halted destination VM, the replicator pods, SSH trust and the
//! periodic replication job.

use anyhow::{Context, Result};
use console::style;

use virtmigrate_core::MigrationConfig;
use virtmigrate_engine::vm::DestinationVm;
use virtmigrate_engine::{InitSummary, MigrationController};

use super::{connect_clusters, engine_error};
use crate::symbols;

/// Run init command
pub async fn run(config: MigrationConfig) -> Result<()> {
    let (source, destination) = connect_clusters(&config);
    let controller = MigrationController::new(config, source, destination);

    let summary = controller
        .init()
        .await
        .map_err(engine_error)
        .context("Migration initialization failed")?;

    print_summary(controller.config(), &summary);
    Ok(())
}

fn print_summary(config: &MigrationConfig, summary: &InitSummary) {
    let vm = style(&config.vm_name).cyan();
    match &summary.destination_vm {
        DestinationVm::Created => println!(
            "{} Destination VM {} created (halted)",
            style(symbols::CHECK).green(),
            vm
        ),
        DestinationVm::Existing(status) => println!(
            "{} Destination VM {} already exists ({})",
            style(symbols::CHECK).green(),
            vm,
            status
        ),
    }

    if summary.initial_copy {
        println!("{} Initial disk copy complete", style(symbols::CHECK).green());
    }

    if summary.replication_job {
        println!(
            "{} Replication scheduled ({})",
            style(symbols::CHECK).green(),
            config.schedule
        );
    } else if config.dry_run {
        println!(
            "{} Dry run: initial copy and replication job skipped",
            style(symbols::WARN).yellow()
        );
    }

    println!();
    println!(
        "Run '{}' when ready to cut over.",
        style(format!("virtmigrate migrate --vm-name {}", config.vm_name)).green()
    );
}
