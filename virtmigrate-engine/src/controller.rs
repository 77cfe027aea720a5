//! Migration controller
//!
//! Two phases, each an ordered list of steps that probe cluster state first
//! and only act when their postcondition is unmet:
//!
//! - `init`: destination VM (halted), replicators, SSH trust, initial copy,
//!   periodic replication job
//! - `migrate`: suspend replication, stop source, final sync, start
//!   destination, clean up

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use virtmigrate_core::{
    MigrateError, MigrationConfig, Result, ResultExt, RetryPolicy, VM_WAIT_TIMEOUT_SECS,
};

use crate::cluster::{CleanupReport, ClusterClient, ClusterSide, ResourceKind, VmStatus};
use crate::mount::{MountProvider, SshfsMount};
use crate::names::ResourceNames;
use crate::replicator::Replicators;
use crate::ssh::SshProvisioner;
use crate::sync::SyncOrchestrator;
use crate::template::TemplateRenderer;
use crate::vm::{ensure_destination_vm, DestinationVm};

/// Bounds for the waits the controller performs
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub vm_timeout: Duration,
    pub pod_ready_timeout: Duration,
    /// `None` waits for the final job without a deadline
    pub final_sync_timeout: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            vm_timeout: Duration::from_secs(VM_WAIT_TIMEOUT_SECS),
            pod_ready_timeout: Duration::from_secs(5 * 60),
            final_sync_timeout: None,
        }
    }
}

/// What `init` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSummary {
    pub destination_vm: DestinationVm,
    pub initial_copy: bool,
    pub replication_job: bool,
}

/// What `migrate` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateSummary {
    /// Source was running and had to be stopped
    pub stopped_source: bool,
    pub cleanup: CleanupReport,
}

/// Drives one VM through init and migrate
pub struct MigrationController {
    config: MigrationConfig,
    source: Arc<dyn ClusterClient>,
    destination: Arc<dyn ClusterClient>,
    replicators: Replicators,
    ssh: SshProvisioner,
    sync: SyncOrchestrator,
    options: ControllerOptions,
}

impl MigrationController {
    pub fn new(
        config: MigrationConfig,
        source: Arc<dyn ClusterClient>,
        destination: Arc<dyn ClusterClient>,
    ) -> Self {
        let mount: Arc<dyn MountProvider> = Arc::new(SshfsMount::new(source.clone()));
        Self::with_mount(config, source, destination, mount)
    }

    /// Controller using a specific mount provider for the initial copy.
    pub fn with_mount(
        config: MigrationConfig,
        source: Arc<dyn ClusterClient>,
        destination: Arc<dyn ClusterClient>,
        mount: Arc<dyn MountProvider>,
    ) -> Self {
        let renderer = TemplateRenderer::new(config.templates_dir.clone());
        Self {
            replicators: Replicators::new(source.clone(), destination.clone(), renderer.clone()),
            ssh: SshProvisioner::new(source.clone(), destination.clone()),
            sync: SyncOrchestrator::new(source.clone(), destination.clone(), mount, renderer),
            config,
            source,
            destination,
            options: ControllerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ssh_verify_policy(mut self, policy: RetryPolicy) -> Self {
        self.ssh = self.ssh.with_verify_policy(policy);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Prepare the destination and start periodic replication.
    pub async fn init(&self) -> Result<InitSummary> {
        let span = info_span!("init", run_id = %Uuid::new_v4(), vm = %self.config.vm_name);
        self.run_init().instrument(span).await
    }

    /// Cut over from source to destination.
    pub async fn migrate(&self) -> Result<MigrateSummary> {
        let span = info_span!("migrate", run_id = %Uuid::new_v4(), vm = %self.config.vm_name);
        self.run_migrate().instrument(span).await
    }

    async fn run_init(&self) -> Result<InitSummary> {
        let config = &self.config;
        let names = ResourceNames::for_vm(&config.vm_name);

        let status = self.source_status().await?;
        info!(status = %status, "Found VM in source cluster");

        let destination_vm = ensure_destination_vm(
            self.source.as_ref(),
            self.destination.as_ref(),
            config,
            false,
            self.options.vm_timeout,
        )
        .await?;

        self.replicators
            .ensure_source(config, self.options.pod_ready_timeout)
            .await?;
        self.ssh
            .generate_keys(config)
            .await
            .context("failed to provision SSH keys")?;
        self.replicators
            .ensure_destination(config, self.options.pod_ready_timeout)
            .await?;
        self.ssh.setup_destination_auth(config).await?;

        if config.dry_run {
            info!("Dry run: skipping initial copy and replication job");
            return Ok(InitSummary {
                destination_vm,
                initial_copy: false,
                replication_job: false,
            });
        }

        // An installed job means an earlier run already finished the copy.
        let copied_before = self
            .source
            .resource_exists(ResourceKind::CronJob, &names.cronjob, &config.namespace)
            .await
            .context("failed to check for replication cronjob")?;
        if copied_before {
            info!(
                cronjob = %names.cronjob,
                "Replication job already installed, skipping initial copy"
            );
        } else {
            self.sync.initial_copy(config).await?;
        }

        self.sync.install_replication_job(config).await?;
        info!("Init complete, replication scheduled");

        Ok(InitSummary {
            destination_vm,
            initial_copy: !copied_before,
            replication_job: true,
        })
    }

    async fn run_migrate(&self) -> Result<MigrateSummary> {
        let config = &self.config;
        let vm = config.vm_name.as_str();
        let namespace = config.namespace.as_str();

        // Both VMs must be visible before the source is touched.
        let status = self.source_status().await?;
        let destination_status = self.destination_status().await?;
        info!(source = %status, destination = %destination_status, "Pre-cutover VM status");

        if let Err(e) = self.sync.suspend(config).await {
            warn!(error = %e, "Failed to suspend replication cronjob, continuing");
        }

        let stopped_source = status != VmStatus::Stopped;
        if stopped_source {
            info!(status = %status, "Stopping source VM");
            self.source
                .stop_vm(vm, namespace)
                .await
                .context("failed to stop source VM")?;
        } else {
            info!("Source VM already stopped");
        }
        self.source
            .wait_for_vm_status(vm, namespace, &VmStatus::Stopped, self.options.vm_timeout)
            .await
            .context("source VM failed to stop")?;

        self.sync
            .run_final_sync(config, self.options.final_sync_timeout)
            .await?;

        match self
            .destination
            .vm_status(vm, namespace)
            .await
            .context("failed to read destination VM status")?
        {
            VmStatus::Running => info!("Destination VM already running"),
            status => {
                info!(status = %status, "Starting destination VM");
                self.destination
                    .start_vm(vm, namespace)
                    .await
                    .context("failed to start destination VM")?;
            }
        }
        self.destination
            .wait_for_vm_status(vm, namespace, &VmStatus::Running, self.options.vm_timeout)
            .await
            .context("destination VM failed to start")?;

        let cleanup = self.cleanup().await;
        if cleanup.success() {
            info!(deleted = cleanup.deleted.len(), "Migration complete");
        } else {
            for error in &cleanup.errors {
                warn!(error = %error, "Cleanup incomplete");
            }
            info!(
                deleted = cleanup.deleted.len(),
                failed = cleanup.errors.len(),
                "Migration complete with cleanup errors"
            );
        }

        Ok(MigrateSummary {
            stopped_source,
            cleanup,
        })
    }

    /// Best-effort removal of every ephemeral object on both sides.
    pub async fn cleanup(&self) -> CleanupReport {
        let vm = self.config.vm_name.as_str();
        let namespace = self.config.namespace.as_str();
        let mut report = self
            .source
            .cleanup_migration_resources(vm, namespace, ClusterSide::Source)
            .await;
        report.merge(
            self.destination
                .cleanup_migration_resources(vm, namespace, ClusterSide::Destination)
                .await,
        );
        report
    }

    async fn source_status(&self) -> Result<VmStatus> {
        vm_status_on(self.source.as_ref(), &self.config, ClusterSide::Source).await
    }

    async fn destination_status(&self) -> Result<VmStatus> {
        vm_status_on(self.destination.as_ref(), &self.config, ClusterSide::Destination).await
    }
}

/// VM status with absence reported as a precondition failure.
async fn vm_status_on(
    cluster: &dyn ClusterClient,
    config: &MigrationConfig,
    side: ClusterSide,
) -> Result<VmStatus> {
    let vm = config.vm_name.as_str();
    let namespace = config.namespace.as_str();
    cluster.vm_status(vm, namespace).await.map_err(|e| {
        if !e.is_not_found() {
            return e.context(format!("failed to read {} VM status", side));
        }
        let message = match side {
            ClusterSide::Source => format!("VM {} not found in namespace {}", vm, namespace),
            ClusterSide::Destination => format!(
                "VM {} not found in destination cluster namespace {}",
                vm, namespace
            ),
        };
        MigrateError::Precondition(message)
    })
}
