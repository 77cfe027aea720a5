//! `oc` / `kubectl` backed cluster client

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use virtmigrate_core::resources::{format_bytes, parse_human_size, BLOCK_SIZE_UTILIZATION};
use virtmigrate_core::runner::CommandRunner;
use virtmigrate_core::{ClusterHandle, KubeCli, MigrateError, Result, ResultExt, POLL_INTERVAL_SECS};

use super::{ClusterClient, ResourceKind, VmInterface, VmStatus};
use crate::names::ResourceNames;

const DISK_USAGE_SCRIPT: &str = "du -sh /run/kubevirt-private/vmi-disks/rootdisk 2>/dev/null || \
du -sh /run/kubevirt-private-vmi-disks/rootdisk 2>/dev/null || \
echo 'Disk not found'";

const DISK_BLOCK_SIZE_SCRIPT: &str = "du -sb /run/kubevirt-private/vmi-disks/rootdisk 2>/dev/null || \
du -sb /run/kubevirt-private-vmi-disks/rootdisk 2>/dev/null";

const DISK_NOT_FOUND: &str = "Disk not found";

/// Cluster client driving one of the two supported CLIs
///
/// The flavor only decides which binary is invoked; both accept the same
/// argument grammar for everything used here.
pub struct KubeClient {
    handle: ClusterHandle,
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
}

impl KubeClient {
    pub fn new(handle: ClusterHandle, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            handle,
            runner,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn scoped_args(&self, namespace: &str, parts: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        args.push("-n".to_string());
        args.push(namespace.to_string());
        args.push("--kubeconfig".to_string());
        args.push(self.handle.kubeconfig.to_string_lossy().into_owned());
        args
    }

    async fn kube(&self, namespace: &str, parts: &[&str]) -> Result<String> {
        let args = self.scoped_args(namespace, parts);
        self.runner.execute(self.handle.cli.binary(), &args).await
    }

    async fn jsonpath(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        path: &str,
    ) -> Result<String> {
        let output = format!("jsonpath={}", path);
        let raw = self.kube(namespace, &["get", kind, name, "-o", &output]).await?;
        Ok(raw.trim().trim_matches('\'').to_string())
    }

    /// `spec.runStrategy` when the VM declares one
    async fn run_strategy(&self, vm: &str, namespace: &str) -> Option<String> {
        match self
            .jsonpath(namespace, "vm", vm, "{.spec.runStrategy}")
            .await
        {
            Ok(value) if !value.is_empty() && value != "null" => Some(value),
            Ok(_) => None,
            Err(e) => {
                debug!(vm, error = %e, "Could not read runStrategy, using running field");
                None
            }
        }
    }

    async fn patch_run_state(&self, vm: &str, namespace: &str, run: bool) -> Result<()> {
        let patch = match self.run_strategy(vm, namespace).await {
            Some(_) => {
                let strategy = if run { "Always" } else { "Halted" };
                info!(vm, strategy, "Patching runStrategy");
                format!(r#"{{"spec":{{"runStrategy":"{}"}}}}"#, strategy)
            }
            None => {
                info!(vm, running = run, "Patching running field");
                format!(r#"{{"spec":{{"running":{}}}}}"#, run)
            }
        };
        self.kube(namespace, &["patch", "vm", vm, "--type", "merge", "-p", &patch])
            .await?;
        Ok(())
    }

    async fn launcher_pod(&self, vm: &str, namespace: &str) -> Result<String> {
        let names = ResourceNames::for_vm(vm);
        let prefix = format!("{}-", names.launcher_prefix);
        let output = self
            .kube(
                namespace,
                &["get", "pods", "--field-selector=status.phase=Running", "-o", "name"],
            )
            .await
            .context("failed to list pods")?;

        output
            .lines()
            .map(|line| line.trim().trim_start_matches("pod/"))
            .find(|pod| pod.starts_with(&prefix))
            .map(str::to_string)
            .ok_or_else(|| MigrateError::NotFound {
                kind: "pod".to_string(),
                name: format!("{}*", prefix),
                namespace: namespace.to_string(),
            })
    }
}

fn timeout_arg(timeout: Option<Duration>) -> String {
    match timeout {
        Some(t) => format!("--timeout={}s", t.as_secs().max(1)),
        // kubectl treats a negative timeout as "wait as long as possible"
        None => "--timeout=-1s".to_string(),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    fn flavor(&self) -> KubeCli {
        self.handle.cli
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn vm_status(&self, vm: &str, namespace: &str) -> Result<VmStatus> {
        let status = self
            .jsonpath(namespace, "vm", vm, "{.status.printableStatus}")
            .await
            .context("failed to get VM status")?;
        if status.is_empty() {
            return Err(MigrateError::Precondition(format!(
                "VM {} reports an empty status",
                vm
            )));
        }
        Ok(VmStatus::parse(&status))
    }

    async fn start_vm(&self, vm: &str, namespace: &str) -> Result<()> {
        self.patch_run_state(vm, namespace, true)
            .await
            .context("failed to start VM")
    }

    async fn stop_vm(&self, vm: &str, namespace: &str) -> Result<()> {
        self.patch_run_state(vm, namespace, false)
            .await
            .context("failed to stop VM")
    }

    async fn export_vm(&self, vm: &str, namespace: &str) -> Result<Value> {
        let raw = self
            .kube(namespace, &["get", "vm", vm, "-o", "json"])
            .await
            .context("failed to export VM")?;
        serde_json::from_str(&raw)
            .map_err(|e| MigrateError::Parse(format!("VM definition is not valid JSON: {}", e)))
    }

    async fn import_vm(&self, definition: &Value, namespace: &str) -> Result<()> {
        let manifest = serde_json::to_string_pretty(definition)
            .map_err(|e| MigrateError::Parse(format!("cannot serialize VM definition: {}", e)))?;
        self.apply_manifest(&manifest, namespace)
            .await
            .context("failed to import VM")
    }

    async fn vm_interface(&self, vm: &str, namespace: &str) -> Result<Option<VmInterface>> {
        let raw = match self.kube(namespace, &["get", "vmi", vm, "-o", "json"]).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.context("failed to read VM instance")),
        };
        let vmi: Value = serde_json::from_str(&raw)
            .map_err(|e| MigrateError::Parse(format!("VM instance is not valid JSON: {}", e)))?;

        Ok(vmi.pointer("/status/interfaces/0").map(|iface| VmInterface {
            ip_address: iface
                .get("ipAddress")
                .and_then(Value::as_str)
                .map(str::to_string),
            mac_address: iface.get("mac").and_then(Value::as_str).map(str::to_string),
        }))
    }

    async fn pod_status(&self, pod: &str, namespace: &str) -> Result<Option<String>> {
        let output = self
            .kube(namespace, &["get", "pod", pod, "--no-headers", "--ignore-not-found"])
            .await
            .context("failed to get pod status")?;
        if output.trim().is_empty() {
            return Ok(None);
        }
        output
            .split_whitespace()
            .nth(2)
            .map(|status| Some(status.to_string()))
            .ok_or_else(|| {
                MigrateError::Parse(format!("unexpected pod listing: {}", output.trim()))
            })
    }

    async fn wait_for_pod(
        &self,
        pod: &str,
        namespace: &str,
        condition: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let condition_arg = format!("--for=condition={}", condition);
        let timeout_arg = timeout_arg(timeout);
        self.kube(namespace, &["wait", "pod", pod, &condition_arg, &timeout_arg])
            .await
            .with_context(|| format!("pod {} did not reach condition {}", pod, condition))?;
        Ok(())
    }

    async fn exec_in_pod(&self, pod: &str, namespace: &str, script: &str) -> Result<String> {
        self.kube(namespace, &["exec", pod, "--", "sh", "-c", script])
            .await
            .with_context(|| format!("failed to execute command in pod {}", pod))
    }

    async fn pod_host_ip(&self, pod: &str, namespace: &str) -> Result<String> {
        let ip = self
            .jsonpath(namespace, "pod", pod, "{.status.hostIP}")
            .await
            .context("failed to get pod host IP")?;
        if ip.is_empty() {
            return Err(MigrateError::Precondition(format!(
                "pod {} has no host IP assigned",
                pod
            )));
        }
        Ok(ip)
    }

    async fn node_port(&self, service: &str, namespace: &str) -> Result<u16> {
        let port = self
            .jsonpath(namespace, "service", service, "{.spec.ports[0].nodePort}")
            .await
            .context("failed to get service NodePort")?;
        port.parse()
            .map_err(|_| MigrateError::Parse(format!("invalid NodePort '{}' on {}", port, service)))
    }

    async fn apply_manifest(&self, manifest: &str, namespace: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("virtmigrate-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(manifest.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        let applied = self
            .kube(namespace, &["apply", "-f", &path])
            .await
            .context("failed to apply manifest");

        if let Err(e) = file.close() {
            warn!(file = %path, error = %e, "Failed to remove temp manifest");
        }
        applied.map(|_| ())
    }

    async fn create_job_from_cronjob(
        &self,
        cronjob: &str,
        job: &str,
        namespace: &str,
    ) -> Result<()> {
        let from = format!("--from=cronjob/{}", cronjob);
        self.kube(namespace, &["create", "job", job, &from])
            .await
            .with_context(|| format!("failed to create job {} from {}", job, cronjob))?;
        Ok(())
    }

    async fn wait_for_job(
        &self,
        job: &str,
        namespace: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let target = format!("job/{}", job);
        let timeout_arg = timeout_arg(timeout);
        self.kube(
            namespace,
            &["wait", "--for=condition=complete", &target, &timeout_arg],
        )
        .await
        .with_context(|| format!("job {} did not complete", job))?;
        Ok(())
    }

    async fn suspend_cronjob(&self, cronjob: &str, namespace: &str) -> Result<()> {
        self.kube(
            namespace,
            &["patch", "cronjob", cronjob, "--type", "merge", "-p", r#"{"spec":{"suspend":true}}"#],
        )
        .await
        .context("failed to suspend cronjob")?;
        Ok(())
    }

    async fn create_secret_from_files(
        &self,
        name: &str,
        namespace: &str,
        files: &[(String, PathBuf)],
    ) -> Result<()> {
        let from_files: Vec<String> = files
            .iter()
            .map(|(key, path)| format!("--from-file={}={}", key, path.display()))
            .collect();

        let mut parts = vec!["create", "secret", "generic", name];
        parts.extend(from_files.iter().map(String::as_str));
        parts.extend(["--dry-run=client", "-o", "yaml"]);

        let manifest = self
            .kube(namespace, &parts)
            .await
            .context("failed to render secret manifest")?;
        self.apply_manifest(&manifest, namespace)
            .await
            .with_context(|| format!("failed to create secret {}", name))
    }

    async fn resource_exists(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool> {
        let output = self
            .kube(
                namespace,
                &["get", kind.as_str(), name, "--no-headers", "--ignore-not-found"],
            )
            .await?;
        Ok(!output.trim().is_empty())
    }

    async fn delete_resource(&self, kind: ResourceKind, name: &str, namespace: &str) -> Result<()> {
        self.kube(
            namespace,
            &["delete", kind.as_str(), name, "--wait", "--ignore-not-found"],
        )
        .await?;
        Ok(())
    }

    async fn pvc_size(&self, claim: &str, namespace: &str) -> Result<String> {
        let size = self
            .jsonpath(namespace, "pvc", claim, "{.spec.resources.requests.storage}")
            .await
            .context("failed to get PVC size")?;
        if size.is_empty() {
            return Err(MigrateError::Precondition(format!(
                "PVC {} declares no storage request",
                claim
            )));
        }
        Ok(size)
    }

    async fn disk_usage(&self, vm: &str, namespace: &str) -> Result<u64> {
        let pod = self.launcher_pod(vm, namespace).await?;

        let usage = self.exec_in_pod(&pod, namespace, DISK_USAGE_SCRIPT).await?;
        if usage.contains(DISK_NOT_FOUND) {
            return Err(MigrateError::NotFound {
                kind: "root disk".to_string(),
                name: pod,
                namespace: namespace.to_string(),
            });
        }

        let apparent = usage
            .split_whitespace()
            .next()
            .ok_or_else(|| MigrateError::Parse(format!("unexpected du output: {}", usage.trim())))?;

        let bytes = match parse_human_size(apparent) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    vm,
                    size = apparent,
                    error = %e,
                    "Failed to parse disk usage, trying block size"
                );
                let block = self.exec_in_pod(&pod, namespace, DISK_BLOCK_SIZE_SCRIPT).await?;
                let block_bytes: u64 = block
                    .split_whitespace()
                    .next()
                    .and_then(|b| b.parse().ok())
                    .ok_or_else(|| {
                        MigrateError::Parse(format!("unexpected du -sb output: {}", block.trim()))
                    })?;
                let estimated = (block_bytes as f64 * BLOCK_SIZE_UTILIZATION) as u64;
                info!(vm, block_bytes, estimated, "Estimated disk usage from block size");
                estimated
            }
        };

        info!(vm, pod = %pod, bytes, human = %format_bytes(bytes), "Measured disk usage");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtmigrate_core::ScriptedRunner;

    fn client(runner: Arc<ScriptedRunner>, cli: KubeCli) -> KubeClient {
        KubeClient::new(ClusterHandle::new(cli, "/kube/src"), runner)
            .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_flavor_selects_binary() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["printableStatus"], "'Running'");

        let oc = client(runner.clone(), KubeCli::Oc);
        assert_eq!(oc.vm_status("vm1", "ns").await.unwrap(), VmStatus::Running);
        let kubectl = client(runner.clone(), KubeCli::Kubectl);
        kubectl.vm_status("vm1", "ns").await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].program, "oc");
        assert_eq!(calls[1].program, "kubectl");
        assert!(calls[0]
            .command_line()
            .ends_with("-n ns --kubeconfig /kube/src"));
    }

    #[tokio::test]
    async fn test_empty_status_is_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["printableStatus"], "");
        let err = client(runner, KubeCli::Oc).vm_status("vm1", "ns").await.unwrap_err();
        assert!(err.to_string().contains("empty status"));
    }

    #[tokio::test]
    async fn test_find_vm_status_maps_not_found() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail(
            &["printableStatus"],
            "Error from server (NotFound): virtualmachines.kubevirt.io \"vm1\" not found",
        );
        let found = client(runner, KubeCli::Oc)
            .find_vm_status("vm1", "ns")
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_stop_uses_run_strategy_when_declared() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["runStrategy"], "Always");
        client(runner.clone(), KubeCli::Oc).stop_vm("vm1", "ns").await.unwrap();

        let patches = runner.calls_matching(&["patch vm vm1"]);
        assert_eq!(patches.len(), 1);
        assert!(patches[0].contains(r#"{"spec":{"runStrategy":"Halted"}}"#));
    }

    #[tokio::test]
    async fn test_start_falls_back_to_running_field() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["runStrategy"], "");
        client(runner.clone(), KubeCli::Kubectl).start_vm("vm1", "ns").await.unwrap();

        let patches = runner.calls_matching(&["patch vm vm1"]);
        assert!(patches[0].contains(r#"{"spec":{"running":true}}"#));
    }

    #[tokio::test]
    async fn test_pod_status_absent_and_present() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond_once(&["get pod p1"], "")
            .respond(&["get pod p1"], "p1   1/1   Running   0   5m");
        let c = client(runner, KubeCli::Oc);
        assert_eq!(c.pod_status("p1", "ns").await.unwrap(), None);
        assert_eq!(c.pod_status("p1", "ns").await.unwrap().as_deref(), Some("Running"));
    }

    #[tokio::test]
    async fn test_wait_timeouts() {
        let runner = Arc::new(ScriptedRunner::new());
        let c = client(runner.clone(), KubeCli::Oc);
        c.wait_for_pod("p1", "ns", "Ready", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        c.wait_for_job("j1", "ns", None).await.unwrap();

        assert_eq!(runner.calls_matching(&["wait pod p1", "--timeout=60s"]).len(), 1);
        assert_eq!(
            runner
                .calls_matching(&["wait --for=condition=complete job/j1", "--timeout=-1s"])
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_wait_for_vm_status_times_out() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["printableStatus"], "Starting");
        let err = client(runner, KubeCli::Oc)
            .wait_for_vm_status("vm1", "ns", &VmStatus::Running, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_vm_status_tolerates_transient_errors() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .fail_once(&["printableStatus"], "connection reset")
            .respond_once(&["printableStatus"], "Stopping")
            .respond(&["printableStatus"], "Stopped");
        client(runner.clone(), KubeCli::Oc)
            .wait_for_vm_status("vm1", "ns", &VmStatus::Stopped, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(runner.calls_matching(&["printableStatus"]).len(), 3);
    }

    #[tokio::test]
    async fn test_node_port_parse() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond_once(&["nodePort"], "'31022'")
            .respond(&["nodePort"], "none");
        let c = client(runner, KubeCli::Oc);
        assert_eq!(c.node_port("svc", "ns").await.unwrap(), 31022);
        assert!(c.node_port("svc", "ns").await.is_err());
    }

    #[tokio::test]
    async fn test_disk_usage_human_readable() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond(
                &["get pods"],
                "pod/virt-launcher-vm10-aaaaa\npod/virt-launcher-vm1-xyz12\n",
            )
            .respond(
                &["exec virt-launcher-vm1-xyz12", "du -sh"],
                "2G\t/run/kubevirt-private/vmi-disks/rootdisk\n",
            );
        let bytes = client(runner, KubeCli::Oc).disk_usage("vm1", "ns").await.unwrap();
        assert_eq!(bytes, 2 << 30);
    }

    #[tokio::test]
    async fn test_disk_usage_block_size_fallback() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond(&["get pods"], "pod/virt-launcher-vm1-xyz12\n")
            .respond(&["du -sh"], "??\t/run/kubevirt-private/vmi-disks/rootdisk\n")
            .respond(&["du -sb"], "1000\t/run/kubevirt-private/vmi-disks/rootdisk\n");
        let bytes = client(runner, KubeCli::Oc).disk_usage("vm1", "ns").await.unwrap();
        assert_eq!(bytes, 300);
    }

    #[tokio::test]
    async fn test_disk_usage_without_launcher() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["get pods"], "pod/other\n");
        let err = client(runner, KubeCli::Oc).disk_usage("vm1", "ns").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_secret_rendered_then_applied() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&["create secret generic"], "apiVersion: v1\nkind: Secret\n");
        let files = vec![
            ("id_rsa".to_string(), PathBuf::from("/tmp/k")),
            ("id_rsa.pub".to_string(), PathBuf::from("/tmp/k.pub")),
        ];
        client(runner.clone(), KubeCli::Oc)
            .create_secret_from_files("vm1-repl-ssh-keys", "ns", &files)
            .await
            .unwrap();

        let create = runner.calls_matching(&["create secret generic vm1-repl-ssh-keys"]);
        assert!(create[0].contains("--from-file=id_rsa=/tmp/k"));
        assert!(create[0].contains("--dry-run=client -o yaml"));
        assert_eq!(runner.calls_matching(&["apply -f"]).len(), 1);
    }

    #[tokio::test]
    async fn test_apply_removes_temp_file() {
        let runner = Arc::new(ScriptedRunner::new());
        client(runner.clone(), KubeCli::Oc)
            .apply_manifest("kind: Pod\n", "ns")
            .await
            .unwrap();

        let call = &runner.calls()[0];
        let path = call
            .args
            .iter()
            .skip_while(|a| *a != "-f")
            .nth(1)
            .cloned()
            .unwrap();
        assert!(path.ends_with(".yaml"));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_cleanup_skips_absent_and_collects_errors() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond(&["get job vm1-repl-final-job"], "")
            .respond(&["get cronjob"], "vm1-repl-cronjob  */15 * * * *  False")
            .respond(&["get pod"], "vm1-src-replicator 1/1 Running 0 1h")
            .respond(&["get secret"], "vm1-repl-ssh-keys Opaque 2 1h")
            .fail(&["delete pod"], "forbidden");

        let report = client(runner.clone(), KubeCli::Oc)
            .cleanup_migration_resources("vm1", "ns", crate::cluster::ClusterSide::Source)
            .await;

        assert!(!report.success());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("pod/vm1-src-replicator"));
        assert_eq!(
            report.deleted,
            vec!["cronjob/vm1-repl-cronjob", "secret/vm1-repl-ssh-keys"]
        );
        assert!(runner.calls_matching(&["delete job"]).is_empty());
    }
}
