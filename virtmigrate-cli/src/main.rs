//! virtmigrate CLI
//!
//! Migrates a KubeVirt virtual machine between two clusters.
//!
//! # Commands
//! - `init` - Create the destination VM and start periodic replication
//! - `migrate` - Stop the source, run a final sync and start the destination
//! - `check` - Validate connectivity, permissions and tooling
//! - `version` - Print version and build information
//!
//! # Configuration
//! Flags, `VIRTMIGRATE_*` environment variables, then the config file
//! (~/.virtmigrate/config.toml or `--config`).

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;
use console::style;

use virtmigrate_cli::cli::{Cli, Commands, MigrationArgs};
use virtmigrate_cli::{commands, config, logging};
use virtmigrate_core::MigrationConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", style("Error:").red(), e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Cli {
        log_level,
        config: config_path,
        command,
    } = cli;

    match command {
        Commands::Init { args, dry_run } => {
            let file = setup(config_path, log_level)?;
            let mut flags = args.into_settings();
            flags.dry_run = dry_run.then_some(true);
            let config = config::resolve(flags, &file)?;
            log_config(&config);
            commands::init(config).await?;
        }

        Commands::Migrate { args } => {
            let file = setup(config_path, log_level)?;
            commands::migrate(resolve(args, &file)?).await?;
        }

        Commands::Check { args } => {
            let file = setup(config_path, log_level)?;
            commands::check(resolve(args, &file)?).await?;
        }

        Commands::Version => commands::version(),
    }

    Ok(())
}

/// Load the config file and start logging; a level flag beats the file.
fn setup(path: Option<PathBuf>, log_level: Option<String>) -> Result<config::ConfigFile> {
    let file = config::load_config(path.as_deref())?;
    logging::init(log_level.as_deref().or(file.log_level.as_deref()))?;
    Ok(file)
}

fn resolve(args: MigrationArgs, file: &config::ConfigFile) -> Result<MigrationConfig> {
    let config = config::resolve(args.into_settings(), file)?;
    log_config(&config);
    Ok(config)
}

fn log_config(config: &MigrationConfig) {
    tracing::debug!(
        vm = %config.vm_name,
        namespace = %config.namespace,
        src_kubeconfig = %config.source.kubeconfig.display(),
        dst_kubeconfig = %config.destination.kubeconfig.display(),
        kubecli = %config.source.cli,
        ssh_port = config.ssh_port,
        sync_tool = config.sync_backend.name(),
        schedule = %config.schedule,
        preserve_ip = config.preserve_ip,
        dry_run = config.dry_run,
        "Configuration parsed"
    );
}
