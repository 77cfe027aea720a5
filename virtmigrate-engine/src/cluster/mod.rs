//! Cluster access
//!
//! [`ClusterClient`] is the seam between orchestration and a cluster. The
//! production implementation shells out to `oc` or `kubectl`
//! ([`KubeClient`]); [`MockCluster`] keeps state in memory for tests.

mod kube;
mod mock;

pub use kube::KubeClient;
pub use mock::{MockCluster, MockPod};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use virtmigrate_core::runner::CommandRunner;
use virtmigrate_core::{ClusterHandle, KubeCli, MigrateError, Result};

use crate::names::ResourceNames;

/// Observed `printableStatus` of a VirtualMachine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VmStatus {
    Running,
    Stopped,
    Starting,
    Stopping,
    Provisioning,
    Migrating,
    Paused,
    Other(String),
}

impl VmStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim().trim_matches('\'') {
            "Running" => VmStatus::Running,
            "Stopped" => VmStatus::Stopped,
            "Starting" => VmStatus::Starting,
            "Stopping" => VmStatus::Stopping,
            "Provisioning" => VmStatus::Provisioning,
            "Migrating" => VmStatus::Migrating,
            "Paused" => VmStatus::Paused,
            other => VmStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VmStatus::Running => "Running",
            VmStatus::Stopped => "Stopped",
            VmStatus::Starting => "Starting",
            VmStatus::Stopping => "Stopping",
            VmStatus::Provisioning => "Provisioning",
            VmStatus::Migrating => "Migrating",
            VmStatus::Paused => "Paused",
            VmStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of objects the migration touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    VirtualMachine,
    Pod,
    Service,
    Secret,
    CronJob,
    Job,
}

impl ResourceKind {
    /// Resource name understood by the cluster CLI
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::VirtualMachine => "vm",
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::Secret => "secret",
            ResourceKind::CronJob => "cronjob",
            ResourceKind::Job => "job",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cluster a cleanup pass runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSide {
    Source,
    Destination,
}

impl ClusterSide {
    /// Ephemeral objects owned by this side, in deletion order
    pub fn ephemeral_resources(&self, names: &ResourceNames) -> Vec<(ResourceKind, String)> {
        match self {
            ClusterSide::Source => vec![
                (ResourceKind::Job, names.final_job.clone()),
                (ResourceKind::CronJob, names.cronjob.clone()),
                (ResourceKind::Pod, names.source_pod.clone()),
                (ResourceKind::Secret, names.ssh_secret.clone()),
            ],
            ClusterSide::Destination => vec![
                (ResourceKind::Pod, names.destination_pod.clone()),
                (ResourceKind::Service, names.destination_service.clone()),
            ],
        }
    }
}

impl fmt::Display for ClusterSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterSide::Source => f.write_str("source"),
            ClusterSide::Destination => f.write_str("destination"),
        }
    }
}

/// Outcome of a best-effort cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// `kind/name` of objects deleted
    pub deleted: Vec<String>,
    /// One message per failed probe or delete
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.deleted.extend(other.deleted);
        self.errors.extend(other.errors);
    }
}

/// First network interface reported by a running VM instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInterface {
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
}

// =============================================================================
// TRAITS FOR DEPENDENCY INJECTION
// =============================================================================

/// Operations the orchestration needs from one cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// CLI flavor behind this client
    fn flavor(&self) -> KubeCli;

    /// Interval between status polls
    fn poll_interval(&self) -> Duration;

    // ===== VirtualMachine lifecycle =====

    async fn vm_status(&self, vm: &str, namespace: &str) -> Result<VmStatus>;

    async fn start_vm(&self, vm: &str, namespace: &str) -> Result<()>;

    async fn stop_vm(&self, vm: &str, namespace: &str) -> Result<()>;

    /// Full VirtualMachine object as JSON
    async fn export_vm(&self, vm: &str, namespace: &str) -> Result<Value>;

    async fn import_vm(&self, definition: &Value, namespace: &str) -> Result<()>;

    /// Interface data of the running instance, if any
    async fn vm_interface(&self, vm: &str, namespace: &str) -> Result<Option<VmInterface>>;

    /// Status of the VM, or `None` when it does not exist.
    async fn find_vm_status(&self, vm: &str, namespace: &str) -> Result<Option<VmStatus>> {
        match self.vm_status(vm, namespace).await {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll until the VM reports `expected` or `timeout` elapses.
    async fn wait_for_vm_status(
        &self,
        vm: &str,
        namespace: &str,
        expected: &VmStatus,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        info!(
            vm,
            namespace,
            expected = %expected,
            timeout_secs = timeout.as_secs(),
            "Waiting for VM status"
        );

        loop {
            match self.vm_status(vm, namespace).await {
                Ok(status) if &status == expected => {
                    info!(vm, status = %status, "VM reached expected status");
                    return Ok(());
                }
                Ok(status) => debug!(
                    vm,
                    current = %status,
                    expected = %expected,
                    "VM not in expected status yet"
                ),
                Err(e) => warn!(vm, error = %e, "Failed to read VM status, will retry"),
            }

            if Instant::now() >= deadline {
                return Err(MigrateError::Timeout {
                    operation: format!("VM {} to reach status {}", vm, expected),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    // ===== Pods =====

    /// Pod phase, or `None` when the pod does not exist.
    async fn pod_status(&self, pod: &str, namespace: &str) -> Result<Option<String>>;

    /// Wait for a pod condition. `None` waits without a deadline.
    async fn wait_for_pod(
        &self,
        pod: &str,
        namespace: &str,
        condition: &str,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Run a shell snippet inside the pod's first container.
    async fn exec_in_pod(&self, pod: &str, namespace: &str, script: &str) -> Result<String>;

    async fn pod_host_ip(&self, pod: &str, namespace: &str) -> Result<String>;

    // ===== Services =====

    async fn node_port(&self, service: &str, namespace: &str) -> Result<u16>;

    // ===== Manifests =====

    /// Apply a rendered manifest to the namespace.
    async fn apply_manifest(&self, manifest: &str, namespace: &str) -> Result<()>;

    // ===== Jobs =====

    async fn create_job_from_cronjob(
        &self,
        cronjob: &str,
        job: &str,
        namespace: &str,
    ) -> Result<()>;

    /// Wait for job completion. `None` waits without a deadline.
    async fn wait_for_job(
        &self,
        job: &str,
        namespace: &str,
        timeout: Option<Duration>,
    ) -> Result<()>;

    async fn suspend_cronjob(&self, cronjob: &str, namespace: &str) -> Result<()>;

    // ===== Secrets =====

    /// Create (or replace) a generic secret from `(key, file)` pairs.
    async fn create_secret_from_files(
        &self,
        name: &str,
        namespace: &str,
        files: &[(String, PathBuf)],
    ) -> Result<()>;

    // ===== Generic objects =====

    async fn resource_exists(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool>;

    async fn delete_resource(&self, kind: ResourceKind, name: &str, namespace: &str) -> Result<()>;

    // ===== Storage =====

    /// Declared capacity of a claim, e.g. `30Gi`
    async fn pvc_size(&self, claim: &str, namespace: &str) -> Result<String>;

    /// Bytes in use on the VM's root disk, measured inside its launcher pod
    async fn disk_usage(&self, vm: &str, namespace: &str) -> Result<u64>;

    // ===== Cleanup =====

    /// Delete every ephemeral migration object on one side.
    ///
    /// Absent objects are skipped. Failures are collected, never returned.
    async fn cleanup_migration_resources(
        &self,
        vm: &str,
        namespace: &str,
        side: ClusterSide,
    ) -> CleanupReport {
        let names = ResourceNames::for_vm(vm);
        let mut report = CleanupReport::default();

        for (kind, name) in side.ephemeral_resources(&names) {
            match self.resource_exists(kind, &name, namespace).await {
                Ok(false) => {
                    debug!(kind = %kind, name = %name, "Resource already absent, skipping");
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    warn!(kind = %kind, name = %name, error = %e, "Failed to check resource");
                    report.errors.push(format!("failed to check {}/{}: {}", kind, name, e));
                    continue;
                }
            }

            match self.delete_resource(kind, &name, namespace).await {
                Ok(()) => {
                    info!(kind = %kind, name = %name, side = %side, "Deleted migration resource");
                    report.deleted.push(format!("{}/{}", kind, name));
                }
                Err(e) => {
                    warn!(kind = %kind, name = %name, error = %e, "Failed to delete resource");
                    report.errors.push(format!("failed to delete {}/{}: {}", kind, name, e));
                }
            }
        }

        report
    }
}

/// Build the client for a cluster handle.
pub fn connect(handle: &ClusterHandle, runner: Arc<dyn CommandRunner>) -> Arc<dyn ClusterClient> {
    Arc::new(KubeClient::new(handle.clone(), runner))
}
