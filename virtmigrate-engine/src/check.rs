//! Feasibility check
//!
//! Dry-runs the replication path end to end with temporary replicators and
//! records a tri-state result per probe. Every probe is present in the
//! results when [`CheckEngine::run`] returns, whatever happened.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use virtmigrate_core::{MigrateError, MigrationConfig, Result, ResultExt, RetryPolicy};

use crate::cluster::{ClusterClient, ResourceKind};
use crate::mount::{
    has_marker, Endpoint, MountProvider, SshfsMount, TCP_FAILURE_MARKER, TOOL_MISSING_MARKER,
    WRITE_FAILURE_MARKER,
};
use crate::names::ResourceNames;
use crate::replicator::Replicators;
use crate::ssh::SshProvisioner;
use crate::template::TemplateRenderer;
use crate::vm::ensure_destination_vm;

/// Probes in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Probe {
    SourceVm,
    DestinationVm,
    SourcePod,
    DestinationPod,
    SshService,
    SshKeys,
    SshAuth,
    NodePort,
    HostIp,
    TcpConnection,
    WritePermissions,
    SshfsAvailable,
    Mount,
    MountVerification,
    Unmount,
}

impl Probe {
    pub const ALL: [Probe; 15] = [
        Probe::SourceVm,
        Probe::DestinationVm,
        Probe::SourcePod,
        Probe::DestinationPod,
        Probe::SshService,
        Probe::SshKeys,
        Probe::SshAuth,
        Probe::NodePort,
        Probe::HostIp,
        Probe::TcpConnection,
        Probe::WritePermissions,
        Probe::SshfsAvailable,
        Probe::Mount,
        Probe::MountVerification,
        Probe::Unmount,
    ];

    /// Display name used in reports
    pub fn name(&self) -> &'static str {
        match self {
            Probe::SourceVm => "Source VM",
            Probe::DestinationVm => "Destination VM",
            Probe::SourcePod => "Source Pod",
            Probe::DestinationPod => "Destination Pod",
            Probe::SshService => "SSH Service",
            Probe::SshKeys => "SSH Keys",
            Probe::SshAuth => "SSH Auth",
            Probe::NodePort => "NodePort",
            Probe::HostIp => "Host IP",
            Probe::TcpConnection => "TCP Connection",
            Probe::WritePermissions => "Write Permissions",
            Probe::SshfsAvailable => "SSHFS Available",
            Probe::Mount => "Mount",
            Probe::MountVerification => "Mount Verification",
            Probe::Unmount => "Unmount",
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tri-state outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeStatus {
    Success,
    Failed,
    NotTested,
}

impl ProbeStatus {
    fn from_ok(ok: bool) -> Self {
        if ok {
            ProbeStatus::Success
        } else {
            ProbeStatus::Failed
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "SUCCESS",
            ProbeStatus::Failed => "FAILED",
            ProbeStatus::NotTested => "NOT TESTED",
        }
    }
}

/// Results of one check run, keyed by probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResults {
    entries: BTreeMap<Probe, ProbeStatus>,
}

impl CheckResults {
    pub fn record(&mut self, probe: Probe, status: ProbeStatus) {
        self.entries.insert(probe, status);
    }

    fn record_ok(&mut self, probe: Probe, ok: bool) {
        self.record(probe, ProbeStatus::from_ok(ok));
    }

    /// Fill every probe without a result with `NotTested`.
    pub fn mark_remaining_not_tested(&mut self) {
        for probe in Probe::ALL {
            self.entries.entry(probe).or_insert(ProbeStatus::NotTested);
        }
    }

    pub fn get(&self, probe: Probe) -> Option<ProbeStatus> {
        self.entries.get(&probe).copied()
    }

    /// Results in probe order
    pub fn iter(&self) -> impl Iterator<Item = (Probe, ProbeStatus)> + '_ {
        self.entries.iter().map(|(probe, status)| (*probe, *status))
    }

    pub fn is_complete(&self) -> bool {
        Probe::ALL.iter().all(|probe| self.entries.contains_key(probe))
    }

    /// No probe failed. Untested probes do not count as failures.
    pub fn all_passed(&self) -> bool {
        !self.entries.values().any(|status| *status == ProbeStatus::Failed)
    }
}

/// What a check run produced
#[derive(Debug)]
pub struct CheckReport {
    pub results: CheckResults,
    /// The fatal error that stopped the sequence, if any
    pub error: Option<MigrateError>,
}

impl CheckReport {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.results.all_passed()
    }
}

/// Bounds for the waits a check performs
#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub vm_timeout: Duration,
    pub pod_ready_timeout: Duration,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            vm_timeout: Duration::from_secs(60),
            pod_ready_timeout: Duration::from_secs(60),
        }
    }
}

/// Runs the feasibility probes
pub struct CheckEngine {
    source: Arc<dyn ClusterClient>,
    destination: Arc<dyn ClusterClient>,
    replicators: Replicators,
    ssh: SshProvisioner,
    mount: Arc<dyn MountProvider>,
    options: CheckOptions,
}

impl CheckEngine {
    pub fn new(
        source: Arc<dyn ClusterClient>,
        destination: Arc<dyn ClusterClient>,
        renderer: TemplateRenderer,
    ) -> Self {
        Self {
            replicators: Replicators::new(source.clone(), destination.clone(), renderer),
            ssh: SshProvisioner::new(source.clone(), destination.clone()),
            mount: Arc::new(SshfsMount::new(source.clone())),
            source,
            destination,
            options: CheckOptions::default(),
        }
    }

    pub fn with_mount(mut self, mount: Arc<dyn MountProvider>) -> Self {
        self.mount = mount;
        self
    }

    pub fn with_ssh_verify_policy(mut self, policy: RetryPolicy) -> Self {
        self.ssh = self.ssh.with_verify_policy(policy);
        self
    }

    pub fn with_options(mut self, options: CheckOptions) -> Self {
        self.options = options;
        self
    }

    /// Run every probe in order, stopping at the first fatal failure.
    #[instrument(skip(self, config), fields(vm = %config.vm_name, namespace = %config.namespace))]
    pub async fn run(&self, config: &MigrationConfig) -> CheckReport {
        let mut results = CheckResults::default();

        let outcome = match self.prepare(config, &mut results).await {
            Ok(()) => {
                let outcome = self.probe_path(config, &mut results).await;
                self.cleanup(config).await;
                outcome
            }
            Err(e) => Err(e),
        };

        results.mark_remaining_not_tested();
        match &outcome {
            Ok(()) => info!("Connectivity checks completed"),
            Err(e) => error!(error = %e, "Connectivity check stopped"),
        }
        CheckReport {
            results,
            error: outcome.err(),
        }
    }

    /// VMs and replicators. Nothing is cleaned up when this fails.
    async fn prepare(&self, config: &MigrationConfig, results: &mut CheckResults) -> Result<()> {
        let vm = config.vm_name.as_str();
        let namespace = config.namespace.as_str();

        let status = self.source.vm_status(vm, namespace).await;
        results.record_ok(Probe::SourceVm, status.is_ok());
        let status = status.map_err(|e| {
            if e.is_not_found() {
                MigrateError::Precondition(format!(
                    "VM {} not found in namespace {}",
                    vm, namespace
                ))
            } else {
                e.context("failed to read source VM status")
            }
        })?;
        info!(vm, status = %status, "Found VM in source cluster");

        let destination = ensure_destination_vm(
            self.source.as_ref(),
            self.destination.as_ref(),
            config,
            true,
            self.options.vm_timeout,
        )
        .await;
        results.record_ok(Probe::DestinationVm, destination.is_ok());
        destination?;

        // pods and service share one failure domain
        let setup = self
            .replicators
            .ensure_all(config, self.options.pod_ready_timeout)
            .await;
        let ok = setup.is_ok();
        results.record_ok(Probe::SourcePod, ok);
        results.record_ok(Probe::DestinationPod, ok);
        results.record_ok(Probe::SshService, ok);
        setup.context("failed to set up test replicators")
    }

    async fn probe_path(&self, config: &MigrationConfig, results: &mut CheckResults) -> Result<()> {
        let names = ResourceNames::for_vm(&config.vm_name);
        let namespace = config.namespace.as_str();

        let keys = self.ssh.generate_keys(config).await;
        results.record_ok(Probe::SshKeys, keys.is_ok());
        keys?;

        let auth = self.ssh.setup_destination_auth(config).await;
        results.record_ok(Probe::SshAuth, auth.is_ok());
        auth?;

        let node_port = self
            .destination
            .node_port(&names.destination_service, namespace)
            .await;
        results.record_ok(Probe::NodePort, node_port.is_ok());
        let node_port = node_port.context("failed to get destination NodePort")?;

        let host_ip = self
            .destination
            .pod_host_ip(&names.destination_pod, namespace)
            .await;
        results.record_ok(Probe::HostIp, host_ip.is_ok());
        let host_ip = host_ip.context("failed to get destination pod host IP")?;

        let endpoint = Endpoint { host_ip, node_port };
        info!(endpoint = %endpoint, "Testing network connectivity");

        if let Err(e) = self.mount.check_connectivity(config, &endpoint).await {
            results.record_ok(Probe::TcpConnection, !has_marker(&e, TCP_FAILURE_MARKER));
            results.record_ok(Probe::WritePermissions, !has_marker(&e, WRITE_FAILURE_MARKER));
            results.record_ok(Probe::SshfsAvailable, !has_marker(&e, TOOL_MISSING_MARKER));
            return Err(e.context("connectivity check failed"));
        }
        results.record_ok(Probe::TcpConnection, true);
        results.record_ok(Probe::WritePermissions, true);
        results.record_ok(Probe::SshfsAvailable, true);

        let mounted = self.mount.mount(config, &endpoint).await;
        results.record_ok(Probe::Mount, mounted.is_ok());
        mounted.context("mount test failed")?;

        if let Err(e) = self.mount.verify_mount(config).await {
            results.record_ok(Probe::MountVerification, false);
            if let Err(unmount) = self.mount.unmount(config).await {
                warn!(error = %unmount, "Failed to unmount after verification failure");
            }
            return Err(e.context("mount verification failed"));
        }
        results.record_ok(Probe::MountVerification, true);

        let unmounted = self.mount.unmount(config).await;
        results.record_ok(Probe::Unmount, unmounted.is_ok());
        if let Err(e) = unmounted {
            warn!(error = %e, "Failed to unmount after test");
        }

        info!(endpoint = %endpoint, "All connectivity probes passed");
        Ok(())
    }

    /// Remove the temporary pods and service. Failures are logged.
    async fn cleanup(&self, config: &MigrationConfig) {
        let names = ResourceNames::for_vm(&config.vm_name);
        let namespace = config.namespace.as_str();
        let targets: [(&dyn ClusterClient, ResourceKind, &str); 3] = [
            (self.source.as_ref(), ResourceKind::Pod, names.source_pod.as_str()),
            (self.destination.as_ref(), ResourceKind::Pod, names.destination_pod.as_str()),
            (self.destination.as_ref(), ResourceKind::Service, names.destination_service.as_str()),
        ];

        info!("Cleaning up test replicators");
        for (cluster, kind, name) in targets {
            if let Err(e) = cluster.delete_resource(kind, name, namespace).await {
                warn!(kind = %kind, name, error = %e, "Failed to clean up test resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_order_and_names() {
        let names: Vec<_> = Probe::ALL.iter().map(Probe::name).collect();
        assert_eq!(names.first(), Some(&"Source VM"));
        assert_eq!(names.last(), Some(&"Unmount"));
        assert_eq!(names.len(), 15);
        // enum order matches declared order
        let mut sorted = Probe::ALL;
        sorted.sort();
        assert_eq!(sorted, Probe::ALL);
    }

    #[test]
    fn test_mark_remaining_keeps_recorded() {
        let mut results = CheckResults::default();
        results.record(Probe::SourceVm, ProbeStatus::Success);
        results.record(Probe::DestinationVm, ProbeStatus::Failed);
        assert!(!results.is_complete());

        results.mark_remaining_not_tested();
        assert!(results.is_complete());
        assert_eq!(results.get(Probe::SourceVm), Some(ProbeStatus::Success));
        assert_eq!(results.get(Probe::DestinationVm), Some(ProbeStatus::Failed));
        assert_eq!(results.get(Probe::Unmount), Some(ProbeStatus::NotTested));
        assert!(!results.all_passed());
    }

    #[test]
    fn test_not_tested_is_not_failure() {
        let mut results = CheckResults::default();
        results.record(Probe::SourceVm, ProbeStatus::Success);
        results.mark_remaining_not_tested();
        assert!(results.all_passed());
        assert_eq!(ProbeStatus::NotTested.label(), "NOT TESTED");
    }
}
