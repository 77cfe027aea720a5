//! In-memory cluster for tests
//!
//! Applied manifests become objects (pods turn `Running` immediately,
//! services get a NodePort), VMs follow start/stop patches, and any
//! operation can be made to fail by name.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use virtmigrate_core::{KubeCli, MigrateError, Result};

use super::{ClusterClient, ResourceKind, VmInterface, VmStatus};

/// Default NodePort handed to services
pub const MOCK_NODE_PORT: u16 = 30022;

/// Default host IP reported by pods
pub const MOCK_HOST_IP: &str = "10.0.0.10";

/// A pod known to the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPod {
    pub phase: String,
    pub host_ip: String,
}

#[derive(Debug, Clone)]
struct MockVm {
    status: VmStatus,
    run_strategy: Option<String>,
    definition: Value,
}

#[derive(Debug, Default)]
struct State {
    vms: HashMap<String, MockVm>,
    pods: HashMap<String, MockPod>,
    services: HashMap<String, u16>,
    secrets: HashMap<String, Vec<String>>,
    cronjobs: HashMap<String, bool>,
    jobs: HashSet<String>,
    manifests: Vec<String>,
    exec_rules: Vec<(String, std::result::Result<String, String>)>,
    execs: Vec<(String, String)>,
    failures: HashMap<String, String>,
    ops: Vec<String>,
    disk_usage: Option<u64>,
    pvc_size: Option<String>,
    interface: Option<VmInterface>,
}

/// Cluster state held in memory
pub struct MockCluster {
    flavor: KubeCli,
    state: Mutex<State>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            flavor: KubeCli::Oc,
            state: Mutex::new(State::default()),
        }
    }

    // ===== Seeding =====

    /// Add a VM with the given status; `run_strategy` mirrors `spec.runStrategy`.
    pub fn add_vm(&self, name: &str, status: VmStatus, run_strategy: Option<&str>) {
        let mut spec = serde_json::Map::new();
        match run_strategy {
            Some(strategy) => {
                spec.insert("runStrategy".into(), Value::String(strategy.to_string()));
            }
            None => {
                spec.insert("running".into(), Value::Bool(status == VmStatus::Running));
            }
        }
        spec.insert(
            "template".into(),
            serde_json::json!({"spec": {"domain": {"devices": {"interfaces": [{"name": "default", "masquerade": {}}]}}}}),
        );
        let definition = serde_json::json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": {
                "name": name,
                "uid": "5a1c6f0e-0000-4000-8000-000000000001",
                "resourceVersion": "4242",
                "creationTimestamp": "2026-01-01T00:00:00Z",
            },
            "spec": Value::Object(spec),
            "status": {"printableStatus": status.as_str()},
        });
        self.state.lock().vms.insert(
            name.to_string(),
            MockVm {
                status,
                run_strategy: run_strategy.map(str::to_string),
                definition,
            },
        );
    }

    pub fn add_pod(&self, name: &str, phase: &str) {
        self.state.lock().pods.insert(
            name.to_string(),
            MockPod {
                phase: phase.to_string(),
                host_ip: MOCK_HOST_IP.to_string(),
            },
        );
    }

    pub fn add_service(&self, name: &str, node_port: u16) {
        self.state.lock().services.insert(name.to_string(), node_port);
    }

    pub fn add_secret(&self, name: &str) {
        self.state.lock().secrets.insert(name.to_string(), Vec::new());
    }

    pub fn add_cronjob(&self, name: &str) {
        self.state.lock().cronjobs.insert(name.to_string(), false);
    }

    pub fn set_vm_status(&self, name: &str, status: VmStatus) {
        if let Some(vm) = self.state.lock().vms.get_mut(name) {
            vm.status = status;
        }
    }

    pub fn set_disk_usage(&self, bytes: Option<u64>) {
        self.state.lock().disk_usage = bytes;
    }

    pub fn set_pvc_size(&self, size: Option<&str>) {
        self.state.lock().pvc_size = size.map(str::to_string);
    }

    pub fn set_interface(&self, interface: Option<VmInterface>) {
        self.state.lock().interface = interface;
    }

    /// Make every call of operation `op` (a trait method name) fail.
    pub fn fail_on(&self, op: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(op.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, op: &str) {
        self.state.lock().failures.remove(op);
    }

    /// Reply `stdout` to in-pod scripts containing `fragment`.
    pub fn on_exec(&self, fragment: &str, stdout: &str) {
        self.state
            .lock()
            .exec_rules
            .push((fragment.to_string(), Ok(stdout.to_string())));
    }

    /// Fail in-pod scripts containing `fragment` with `stderr`.
    pub fn fail_exec(&self, fragment: &str, stderr: &str) {
        self.state
            .lock()
            .exec_rules
            .push((fragment.to_string(), Err(stderr.to_string())));
    }

    // ===== Inspection =====

    pub fn vm_status_now(&self, name: &str) -> Option<VmStatus> {
        self.state.lock().vms.get(name).map(|vm| vm.status.clone())
    }

    pub fn vm_definition(&self, name: &str) -> Option<Value> {
        self.state.lock().vms.get(name).map(|vm| vm.definition.clone())
    }

    pub fn pod(&self, name: &str) -> Option<MockPod> {
        self.state.lock().pods.get(name).cloned()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.state.lock().services.contains_key(name)
    }

    pub fn secret_keys(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().secrets.get(name).cloned()
    }

    pub fn cronjob_suspended(&self, name: &str) -> Option<bool> {
        self.state.lock().cronjobs.get(name).copied()
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.state.lock().jobs.contains(name)
    }

    /// Manifests applied so far, in order
    pub fn manifests(&self) -> Vec<String> {
        self.state.lock().manifests.clone()
    }

    /// `(pod, script)` pairs executed so far
    pub fn execs(&self) -> Vec<(String, String)> {
        self.state.lock().execs.clone()
    }

    /// Operation log, one `op name` entry per call
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    /// Number of logged operations whose entry starts with `prefix`
    pub fn op_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    fn record(&self, op: &str, target: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(format!("{} {}", op, target));
        match state.failures.get(op) {
            Some(message) => Err(MigrateError::CommandFailed {
                program: self.flavor.binary().to_string(),
                args: format!("{} {}", op, target),
                status: Some(1),
                stderr: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn not_found(kind: &str, name: &str, namespace: &str) -> MigrateError {
    MigrateError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

/// `kind` and `metadata.name` of a rendered manifest
fn manifest_identity(manifest: &str) -> Option<(String, String)> {
    let mut kind = None;
    let mut name = None;
    let mut in_metadata = false;
    for line in manifest.lines() {
        if let Some(value) = line.strip_prefix("kind:") {
            kind.get_or_insert_with(|| value.trim().to_string());
        }
        if line.starts_with("metadata:") {
            in_metadata = true;
            continue;
        }
        if in_metadata {
            if !line.starts_with(' ') {
                in_metadata = false;
            } else if let Some(value) = line.trim().strip_prefix("name:") {
                name.get_or_insert_with(|| value.trim().to_string());
            }
        }
    }
    Some((kind?, name?))
}

fn definition_status(definition: &Value) -> VmStatus {
    let halted = definition.pointer("/spec/runStrategy").and_then(Value::as_str) == Some("Halted")
        || definition.pointer("/spec/running").and_then(Value::as_bool) == Some(false);
    if halted {
        VmStatus::Stopped
    } else {
        VmStatus::Running
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    fn flavor(&self) -> KubeCli {
        self.flavor
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }

    async fn vm_status(&self, vm: &str, namespace: &str) -> Result<VmStatus> {
        self.record("vm_status", vm)?;
        self.state
            .lock()
            .vms
            .get(vm)
            .map(|v| v.status.clone())
            .ok_or_else(|| not_found("vm", vm, namespace))
    }

    async fn start_vm(&self, vm: &str, namespace: &str) -> Result<()> {
        self.record("start_vm", vm)?;
        let mut state = self.state.lock();
        let entry = state.vms.get_mut(vm).ok_or_else(|| not_found("vm", vm, namespace))?;
        entry.status = VmStatus::Running;
        if entry.run_strategy.is_some() {
            entry.run_strategy = Some("Always".to_string());
        }
        Ok(())
    }

    async fn stop_vm(&self, vm: &str, namespace: &str) -> Result<()> {
        self.record("stop_vm", vm)?;
        let mut state = self.state.lock();
        let entry = state.vms.get_mut(vm).ok_or_else(|| not_found("vm", vm, namespace))?;
        entry.status = VmStatus::Stopped;
        if entry.run_strategy.is_some() {
            entry.run_strategy = Some("Halted".to_string());
        }
        Ok(())
    }

    async fn export_vm(&self, vm: &str, namespace: &str) -> Result<Value> {
        self.record("export_vm", vm)?;
        self.state
            .lock()
            .vms
            .get(vm)
            .map(|v| v.definition.clone())
            .ok_or_else(|| not_found("vm", vm, namespace))
    }

    async fn import_vm(&self, definition: &Value, namespace: &str) -> Result<()> {
        let name = definition
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.record("import_vm", &name)?;
        if name.is_empty() {
            return Err(MigrateError::Precondition(format!(
                "VM definition for namespace {} has no name",
                namespace
            )));
        }
        let vm = MockVm {
            status: definition_status(definition),
            run_strategy: definition
                .pointer("/spec/runStrategy")
                .and_then(Value::as_str)
                .map(str::to_string),
            definition: definition.clone(),
        };
        self.state.lock().vms.insert(name, vm);
        Ok(())
    }

    async fn vm_interface(&self, vm: &str, _namespace: &str) -> Result<Option<VmInterface>> {
        self.record("vm_interface", vm)?;
        Ok(self.state.lock().interface.clone())
    }

    async fn pod_status(&self, pod: &str, _namespace: &str) -> Result<Option<String>> {
        self.record("pod_status", pod)?;
        Ok(self.state.lock().pods.get(pod).map(|p| p.phase.clone()))
    }

    async fn wait_for_pod(
        &self,
        pod: &str,
        namespace: &str,
        condition: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.record("wait_for_pod", pod)?;
        let mut state = self.state.lock();
        let entry = state
            .pods
            .get_mut(pod)
            .ok_or_else(|| not_found("pod", pod, namespace))?;
        if condition == "Ready" && entry.phase != "Running" {
            return Err(MigrateError::Timeout {
                operation: format!("pod {} condition {}", pod, condition),
                waited: timeout.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn exec_in_pod(&self, pod: &str, namespace: &str, script: &str) -> Result<String> {
        self.record("exec_in_pod", pod)?;
        let mut state = self.state.lock();
        if !state.pods.contains_key(pod) {
            return Err(not_found("pod", pod, namespace));
        }
        state.execs.push((pod.to_string(), script.to_string()));
        let reply = state
            .exec_rules
            .iter()
            .find(|(fragment, _)| script.contains(fragment.as_str()))
            .map(|(_, reply)| reply.clone());
        match reply {
            None => Ok(String::new()),
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(stderr)) => Err(MigrateError::CommandFailed {
                program: self.flavor.binary().to_string(),
                args: format!("exec {} -- sh -c", pod),
                status: Some(1),
                stderr,
            }),
        }
    }

    async fn pod_host_ip(&self, pod: &str, namespace: &str) -> Result<String> {
        self.record("pod_host_ip", pod)?;
        self.state
            .lock()
            .pods
            .get(pod)
            .map(|p| p.host_ip.clone())
            .ok_or_else(|| not_found("pod", pod, namespace))
    }

    async fn node_port(&self, service: &str, namespace: &str) -> Result<u16> {
        self.record("node_port", service)?;
        self.state
            .lock()
            .services
            .get(service)
            .copied()
            .ok_or_else(|| not_found("service", service, namespace))
    }

    async fn apply_manifest(&self, manifest: &str, namespace: &str) -> Result<()> {
        let (kind, name) = manifest_identity(manifest).ok_or_else(|| {
            MigrateError::Template(format!("manifest for {} has no kind/name", namespace))
        })?;
        self.record("apply_manifest", &format!("{}/{}", kind, name))?;

        let mut state = self.state.lock();
        state.manifests.push(manifest.to_string());
        match kind.as_str() {
            "Pod" => {
                state.pods.insert(
                    name,
                    MockPod {
                        phase: "Running".to_string(),
                        host_ip: MOCK_HOST_IP.to_string(),
                    },
                );
            }
            "Service" => {
                state.services.entry(name).or_insert(MOCK_NODE_PORT);
            }
            "CronJob" => {
                state.cronjobs.insert(name, false);
            }
            "Secret" => {
                state.secrets.entry(name).or_default();
            }
            _ => {}
        }
        Ok(())
    }

    async fn create_job_from_cronjob(
        &self,
        cronjob: &str,
        job: &str,
        namespace: &str,
    ) -> Result<()> {
        self.record("create_job_from_cronjob", job)?;
        let mut state = self.state.lock();
        if !state.cronjobs.contains_key(cronjob) {
            return Err(not_found("cronjob", cronjob, namespace));
        }
        if !state.jobs.insert(job.to_string()) {
            return Err(MigrateError::CommandFailed {
                program: self.flavor.binary().to_string(),
                args: format!("create job {}", job),
                status: Some(1),
                stderr: format!("jobs.batch \"{}\" already exists", job),
            });
        }
        Ok(())
    }

    async fn wait_for_job(
        &self,
        job: &str,
        namespace: &str,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        self.record("wait_for_job", job)?;
        if self.state.lock().jobs.contains(job) {
            Ok(())
        } else {
            Err(not_found("job", job, namespace))
        }
    }

    async fn suspend_cronjob(&self, cronjob: &str, namespace: &str) -> Result<()> {
        self.record("suspend_cronjob", cronjob)?;
        match self.state.lock().cronjobs.get_mut(cronjob) {
            Some(suspended) => {
                *suspended = true;
                Ok(())
            }
            None => Err(not_found("cronjob", cronjob, namespace)),
        }
    }

    async fn create_secret_from_files(
        &self,
        name: &str,
        _namespace: &str,
        files: &[(String, PathBuf)],
    ) -> Result<()> {
        self.record("create_secret_from_files", name)?;
        let keys = files.iter().map(|(key, _)| key.clone()).collect();
        self.state.lock().secrets.insert(name.to_string(), keys);
        Ok(())
    }

    async fn resource_exists(
        &self,
        kind: ResourceKind,
        name: &str,
        _namespace: &str,
    ) -> Result<bool> {
        self.record("resource_exists", &format!("{}/{}", kind, name))?;
        let state = self.state.lock();
        Ok(match kind {
            ResourceKind::VirtualMachine => state.vms.contains_key(name),
            ResourceKind::Pod => state.pods.contains_key(name),
            ResourceKind::Service => state.services.contains_key(name),
            ResourceKind::Secret => state.secrets.contains_key(name),
            ResourceKind::CronJob => state.cronjobs.contains_key(name),
            ResourceKind::Job => state.jobs.contains(name),
        })
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        _namespace: &str,
    ) -> Result<()> {
        self.record("delete_resource", &format!("{}/{}", kind, name))?;
        let mut state = self.state.lock();
        match kind {
            ResourceKind::VirtualMachine => {
                state.vms.remove(name);
            }
            ResourceKind::Pod => {
                state.pods.remove(name);
            }
            ResourceKind::Service => {
                state.services.remove(name);
            }
            ResourceKind::Secret => {
                state.secrets.remove(name);
            }
            ResourceKind::CronJob => {
                state.cronjobs.remove(name);
            }
            ResourceKind::Job => {
                state.jobs.remove(name);
            }
        }
        Ok(())
    }

    async fn pvc_size(&self, claim: &str, namespace: &str) -> Result<String> {
        self.record("pvc_size", claim)?;
        self.state
            .lock()
            .pvc_size
            .clone()
            .ok_or_else(|| not_found("pvc", claim, namespace))
    }

    async fn disk_usage(&self, vm: &str, namespace: &str) -> Result<u64> {
        self.record("disk_usage", vm)?;
        self.state
            .lock()
            .disk_usage
            .ok_or_else(|| not_found("root disk", vm, namespace))
    }
}
