//! Command-line surface
//!
//! Every flag has an environment mirror under the `VIRTMIGRATE_` prefix.
//! Values left unset fall through to the config file, then to defaults.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use virtmigrate_core::MigrationSettings;

#[derive(Parser, Debug)]
#[command(name = "virtmigrate")]
#[command(about = "Migrate KubeVirt virtual machines between clusters")]
#[command(version)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "VIRTMIGRATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Config file (default: ~/.virtmigrate/config.toml when present)
    #[arg(long, global = true, env = "VIRTMIGRATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the destination VM and start periodic replication
    Init {
        #[command(flatten)]
        args: MigrationArgs,

        /// Provision everything but skip the initial copy and replication job
        #[arg(long, env = "VIRTMIGRATE_DRY_RUN")]
        dry_run: bool,
    },

    /// Stop the source, run a final sync and start the destination
    Migrate {
        #[command(flatten)]
        args: MigrationArgs,
    },

    /// Validate connectivity, permissions and tooling for a migration
    Check {
        #[command(flatten)]
        args: MigrationArgs,
    },

    /// Print version and build information
    Version,
}

/// Flags shared by the migration subcommands
#[derive(Args, Debug, Clone, Default)]
pub struct MigrationArgs {
    /// Name of the virtual machine
    #[arg(long, env = "VIRTMIGRATE_VM_NAME")]
    pub vm_name: Option<String>,

    /// Namespace of the VM in both clusters
    #[arg(long, env = "VIRTMIGRATE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Source cluster kubeconfig file
    #[arg(long, env = "VIRTMIGRATE_SRC_KUBECONFIG")]
    pub src_kubeconfig: Option<PathBuf>,

    /// Destination cluster kubeconfig file
    #[arg(long, env = "VIRTMIGRATE_DST_KUBECONFIG")]
    pub dst_kubeconfig: Option<PathBuf>,

    /// SSH port exposed by the destination replicator [default: 22]
    #[arg(long, env = "VIRTMIGRATE_SSH_PORT")]
    pub ssh_port: Option<u16>,

    /// Cluster CLI to use (oc, kubectl) [default: oc]
    #[arg(long, env = "VIRTMIGRATE_KUBECLI")]
    pub kubecli: Option<String>,

    /// File sync tool (rclone, rsync) [default: rclone]
    #[arg(long, env = "VIRTMIGRATE_SYNC_TOOL")]
    pub sync_tool: Option<String>,

    /// Keep the source VM's IP and MAC address on the destination
    #[arg(long, env = "VIRTMIGRATE_PRESERVE_POD_IP")]
    pub preserve_pod_ip: bool,

    /// Cron schedule for periodic replication [default: "*/15 * * * *"]
    #[arg(long, env = "VIRTMIGRATE_REPLICATION_SCHEDULE")]
    pub replication_schedule: Option<String>,

    /// Directory with manifest templates overriding the built-in ones
    #[arg(long, env = "VIRTMIGRATE_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,
}

impl MigrationArgs {
    /// Settings layer for these flags; switches left off stay unset.
    pub fn into_settings(self) -> MigrationSettings {
        MigrationSettings {
            vm_name: self.vm_name,
            namespace: self.namespace,
            src_kubeconfig: self.src_kubeconfig,
            dst_kubeconfig: self.dst_kubeconfig,
            ssh_port: self.ssh_port,
            kubecli: self.kubecli,
            sync_tool: self.sync_tool,
            replication_schedule: self.replication_schedule,
            preserve_pod_ip: self.preserve_pod_ip.then_some(true),
            dry_run: None,
            templates_dir: self.templates_dir,
        }
    }
}
