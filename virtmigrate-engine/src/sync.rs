//! Sync orchestration
//!
//! Owns the two data paths between the replicators: the one-shot bulk copy
//! done during init, and the replication script that the periodic and final
//! jobs run inside the source cluster.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tracing::{debug, info, warn};

use virtmigrate_core::{
    MigrateError, MigrationConfig, ResourceProfile, Result, ResultExt, SyncOptions,
};

use crate::cluster::{ClusterClient, ResourceKind};
use crate::mount::{Endpoint, MountProvider};
use crate::names::{ResourceNames, DISK_IMAGE, REMOTE_DATA_DIR, SOURCE_DATA_DIR};
use crate::template::{TemplateKind, TemplateRenderer, TemplateVars};

/// Script run by the replication jobs. `@…@` markers are filled in by
/// [`SyncOrchestrator::replication_script`].
const REPLICATION_SCRIPT: &str = r#"set -u
mkdir -p /data/dimg
mountpoint -q /data/dimg || sshfs -o StrictHostKeyChecking=no -o port=@NODE_PORT@ @HOST_IP@:/data/simg /data/dimg
DISK_IMG=/data/simg/disk.img

# Filesystem-bearing partitions according to the partition table
PART_NUMS=()
for partition in $(fdisk -l "$DISK_IMG" | grep "Linux filesystem" | awk '{print $1}'); do
    PART_NUMS+=("${partition##*img}")
done

DEVICES=()
for dev in $(virt-filesystems --partitions --format=raw -a "$DISK_IMG"); do
    for num in "${PART_NUMS[@]}"; do
        if [[ $dev == */[a-z]*$num ]]; then
            DEVICES+=("$dev")
        fi
    done
done

for device in "${DEVICES[@]}"; do
    name=$(basename "$device")
    mkdir -p /data/sfs_${name} /data/dfs_${name}
    guestmount -a /data/simg/disk.img -m ${device} --ro /data/sfs_${name}
    guestmount -a /data/dimg/disk.img -m ${device} --rw /data/dfs_${name}
    @SYNC_COMMAND@
    guestunmount /data/dfs_${name}
    guestunmount /data/sfs_${name}
done

sleep 20
"#;

/// Everything the periodic job manifest needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationJobSpec {
    pub schedule: String,
    /// Base64 (standard alphabet) of the replication script
    pub encoded_command: String,
    pub resources: ResourceProfile,
}

impl ReplicationJobSpec {
    /// Decode the embedded script back to text.
    pub fn decoded_command(&self) -> Result<String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.encoded_command)
            .map_err(|e| MigrateError::Parse(format!("invalid command payload: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| MigrateError::Parse(format!("command payload is not UTF-8: {}", e)))
    }
}

/// Builds replication jobs and runs the initial copy
pub struct SyncOrchestrator {
    source: Arc<dyn ClusterClient>,
    destination: Arc<dyn ClusterClient>,
    mount: Arc<dyn MountProvider>,
    renderer: TemplateRenderer,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn ClusterClient>,
        destination: Arc<dyn ClusterClient>,
        mount: Arc<dyn MountProvider>,
        renderer: TemplateRenderer,
    ) -> Self {
        Self {
            source,
            destination,
            mount,
            renderer,
            options: SyncOptions::default(),
        }
    }

    pub fn with_sync_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// NodePort and host IP of the destination replicator.
    pub async fn destination_endpoint(&self, config: &MigrationConfig) -> Result<Endpoint> {
        let names = ResourceNames::for_vm(&config.vm_name);
        let node_port = self
            .destination
            .node_port(&names.destination_service, &config.namespace)
            .await
            .context("failed to get destination NodePort")?;
        let host_ip = self
            .destination
            .pod_host_ip(&names.destination_pod, &config.namespace)
            .await
            .context("failed to get destination host IP")?;
        Ok(Endpoint { host_ip, node_port })
    }

    /// Copy the whole disk image once, through a verified mount.
    pub async fn initial_copy(&self, config: &MigrationConfig) -> Result<()> {
        let names = ResourceNames::for_vm(&config.vm_name);
        let endpoint = self.destination_endpoint(config).await?;
        info!(
            vm = %config.vm_name,
            endpoint = %endpoint,
            sync_tool = %config.sync_backend,
            "Starting initial volume copy"
        );

        self.mount
            .check_connectivity(config, &endpoint)
            .await
            .context("connectivity check failed")?;
        self.mount.mount(config, &endpoint).await?;
        self.mount.verify_mount(config).await?;

        let copy = format!(
            "cp -p --sparse=always {}/{} {}/",
            SOURCE_DATA_DIR, DISK_IMAGE, REMOTE_DATA_DIR
        );
        let copied = self
            .source
            .exec_in_pod(&names.source_pod, &config.namespace, &copy)
            .await
            .context("initial disk copy failed");

        if let Err(e) = self.mount.unmount(config).await {
            warn!(vm = %config.vm_name, error = %e, "Failed to unmount after initial copy");
        }

        copied?;
        info!(vm = %config.vm_name, "Initial volume copy complete");
        Ok(())
    }

    /// Shell script the replication jobs execute.
    pub fn replication_script(&self, config: &MigrationConfig, endpoint: &Endpoint) -> String {
        let sync = config
            .sync_backend
            .invocation(&self.options)
            .command_line("/data/sfs_${name}/", "/data/dfs_${name}/");
        REPLICATION_SCRIPT
            .replace("@NODE_PORT@", &endpoint.node_port.to_string())
            .replace("@HOST_IP@", &endpoint.host_ip)
            .replace("@SYNC_COMMAND@", &sync)
    }

    /// Size the replication job from the live source cluster.
    ///
    /// Measured usage first, then 25% of the claim capacity, then defaults.
    pub async fn resource_profile(&self, config: &MigrationConfig) -> ResourceProfile {
        let vm = config.vm_name.as_str();
        let namespace = config.namespace.as_str();

        let usage_err = match self.source.disk_usage(vm, namespace).await {
            Ok(bytes) => {
                let profile = ResourceProfile::from_used_bytes(bytes);
                info!(
                    vm,
                    used_bytes = bytes,
                    cpu_limit = %profile.cpu_limit,
                    memory_limit = %profile.memory_limit,
                    "Sized replication job from disk usage"
                );
                return profile;
            }
            Err(e) => e,
        };
        warn!(vm, error = %usage_err, "Could not measure disk usage, falling back to PVC size");

        let names = ResourceNames::for_vm(vm);
        match self.source.pvc_size(names.root_disk_claim(), namespace).await {
            Ok(capacity) => match ResourceProfile::from_pvc_capacity(&capacity) {
                Ok(profile) => {
                    info!(
                        vm,
                        capacity = %capacity,
                        cpu_limit = %profile.cpu_limit,
                        memory_limit = %profile.memory_limit,
                        "Sized replication job from PVC capacity"
                    );
                    return profile;
                }
                Err(e) => warn!(
                    vm,
                    capacity = %capacity,
                    error = %e,
                    "Unparseable PVC capacity, using default resources"
                ),
            },
            Err(e) => warn!(vm, error = %e, "Could not read PVC size, using default resources"),
        }
        ResourceProfile::default()
    }

    /// Assemble the periodic job: fresh endpoint, script and sizing.
    pub async fn build_job_spec(&self, config: &MigrationConfig) -> Result<ReplicationJobSpec> {
        let endpoint = self.destination_endpoint(config).await?;
        let script = self.replication_script(config, &endpoint);
        let encoded_command = base64::engine::general_purpose::STANDARD.encode(script.as_bytes());
        debug!(command = %script, encoded = %encoded_command, "Generated replication command");

        Ok(ReplicationJobSpec {
            schedule: config.schedule.clone(),
            encoded_command,
            resources: self.resource_profile(config).await,
        })
    }

    /// Render and apply the periodic replication job in the source cluster.
    pub async fn install_replication_job(
        &self,
        config: &MigrationConfig,
    ) -> Result<ReplicationJobSpec> {
        let spec = self.build_job_spec(config).await?;
        let vars = TemplateVars {
            schedule: Some(spec.schedule.clone()),
            replication_command: Some(spec.encoded_command.clone()),
            sync_tool: Some(config.sync_backend.name().to_string()),
            resources: Some(spec.resources.clone()),
            ..TemplateVars::new(&config.vm_name, &config.namespace)
        };
        self.renderer
            .render_and_apply(TemplateKind::ReplicationJob, &vars, self.source.as_ref())
            .await
            .context("failed to create replication cronjob")?;

        info!(
            vm = %config.vm_name,
            schedule = %spec.schedule,
            cpu_limit = %spec.resources.cpu_limit,
            memory_limit = %spec.resources.memory_limit,
            "Replication cronjob installed"
        );
        Ok(spec)
    }

    /// Run one job cloned from the periodic job and wait for it to complete.
    ///
    /// `timeout` of `None` waits without a deadline.
    pub async fn run_final_sync(
        &self,
        config: &MigrationConfig,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let names = ResourceNames::for_vm(&config.vm_name);
        let namespace = config.namespace.as_str();

        if self
            .source
            .resource_exists(ResourceKind::Job, &names.final_job, namespace)
            .await
            .context("failed to check for final job")?
        {
            info!(job = %names.final_job, "Final replication job already exists, waiting on it");
        } else {
            self.source
                .create_job_from_cronjob(&names.cronjob, &names.final_job, namespace)
                .await
                .context("failed to create final job")?;
            info!(job = %names.final_job, "Created final replication job");
        }

        self.source
            .wait_for_job(&names.final_job, namespace, timeout)
            .await
            .context("failed waiting for final job")?;
        info!(job = %names.final_job, "Final replication complete");
        Ok(())
    }

    pub async fn suspend(&self, config: &MigrationConfig) -> Result<()> {
        let names = ResourceNames::for_vm(&config.vm_name);
        self.source
            .suspend_cronjob(&names.cronjob, &config.namespace)
            .await
            .context("failed to suspend cronjob")?;
        info!(cronjob = %names.cronjob, "Replication cronjob suspended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::mount::SshfsMount;
    use virtmigrate_core::{MigrationSettings, SyncBackend};

    fn config() -> MigrationConfig {
        MigrationSettings {
            vm_name: Some("fedora".into()),
            namespace: Some("vms".into()),
            src_kubeconfig: Some("/tmp/src".into()),
            dst_kubeconfig: Some("/tmp/dst".into()),
            ..Default::default()
        }
        .into_config()
        .unwrap()
    }

    fn setup() -> (Arc<MockCluster>, Arc<MockCluster>, SyncOrchestrator) {
        let source = Arc::new(MockCluster::new());
        let destination = Arc::new(MockCluster::new());
        source.add_pod("fedora-src-replicator", "Running");
        destination.add_pod("fedora-dst-replicator", "Running");
        destination.add_service("fedora-dst-svc", 31022);
        let mount = Arc::new(SshfsMount::new(source.clone()));
        let orchestrator = SyncOrchestrator::new(
            source.clone(),
            destination.clone(),
            mount,
            TemplateRenderer::default(),
        );
        (source, destination, orchestrator)
    }

    #[tokio::test]
    async fn test_destination_endpoint() {
        let (_, _, orchestrator) = setup();
        let endpoint = orchestrator.destination_endpoint(&config()).await.unwrap();
        assert_eq!(endpoint.node_port, 31022);
        assert_eq!(endpoint.host_ip, "10.0.0.10");
    }

    #[test]
    fn test_script_parameterized_per_backend() {
        let (_, _, orchestrator) = setup();
        let endpoint = Endpoint {
            host_ip: "192.168.1.5".into(),
            node_port: 31022,
        };

        let rclone = orchestrator.replication_script(&config(), &endpoint);
        assert!(rclone.contains("-o port=31022 192.168.1.5:/data/simg /data/dimg"));
        assert!(rclone.contains("rclone sync --progress --checkers 8"));
        assert!(rclone.contains("/data/sfs_${name}/ /data/dfs_${name}/"));
        assert!(rclone.contains("virt-filesystems --partitions --format=raw"));
        assert!(!rclone.contains("@NODE_PORT@") && !rclone.contains("@SYNC_COMMAND@"));

        let mut rsync_config = config();
        rsync_config.sync_backend = SyncBackend::Rsync;
        let rsync = orchestrator.replication_script(&rsync_config, &endpoint);
        assert!(rsync.contains("rsync -avzP --delete --timeout=300 --contimeout=100 /data/sfs_"));
    }

    #[tokio::test]
    async fn test_profile_prefers_measured_usage() {
        let (source, _, orchestrator) = setup();
        source.set_disk_usage(Some(20 << 30));
        source.set_pvc_size(Some("100Gi"));
        let profile = orchestrator.resource_profile(&config()).await;
        assert_eq!(profile.memory_limit, "6Gi");
        assert_eq!(source.op_count("pvc_size"), 0);
    }

    #[tokio::test]
    async fn test_profile_falls_back_to_pvc_then_default() {
        let (source, _, orchestrator) = setup();
        source.set_pvc_size(Some("80Gi"));
        // 25% of 80Gi is 20Gi
        let profile = orchestrator.resource_profile(&config()).await;
        assert_eq!(profile, ResourceProfile::from_used_bytes(20 << 30));

        source.set_pvc_size(None);
        assert_eq!(orchestrator.resource_profile(&config()).await, ResourceProfile::default());
    }

    #[tokio::test]
    async fn test_job_spec_round_trips_script() {
        let (_, _, orchestrator) = setup();
        let spec = orchestrator.build_job_spec(&config()).await.unwrap();
        assert_eq!(spec.schedule, "*/15 * * * *");
        let script = spec.decoded_command().unwrap();
        assert!(script.contains("-o port=31022 10.0.0.10:/data/simg"));
    }

    #[tokio::test]
    async fn test_install_replication_job() {
        let (source, _, orchestrator) = setup();
        source.set_disk_usage(Some(3 << 30));
        let spec = orchestrator.install_replication_job(&config()).await.unwrap();

        assert_eq!(source.cronjob_suspended("fedora-repl-cronjob"), Some(false));
        let manifest = source.manifests().pop().unwrap();
        assert!(manifest.contains(&spec.encoded_command));
        assert!(manifest.contains(r#"cpu: "0.7""#));
        assert!(manifest.contains(r#"value: "rclone""#));
    }

    #[tokio::test]
    async fn test_initial_copy_gated_on_connectivity() {
        let (source, _, orchestrator) = setup();
        // no replies: TCP probe and tool probe fail
        let err = orchestrator.initial_copy(&config()).await.unwrap_err();
        assert!(err.to_string().contains("connectivity check failed"));
        assert!(!source.execs().iter().any(|(_, s)| s.starts_with("cp ")));
    }

    #[tokio::test]
    async fn test_initial_copy_runs_sparse_copy_and_unmounts() {
        let (source, _, orchestrator) = setup();
        source.on_exec("/dev/tcp", "Connection successful");
        source.on_exec("which sshfs", "/usr/bin/sshfs");
        source.on_exec("ls -la", "disk.img");

        orchestrator.initial_copy(&config()).await.unwrap();
        let scripts: Vec<_> = source.execs().into_iter().map(|(_, s)| s).collect();
        let copy = scripts.iter().position(|s| s.starts_with("cp -p --sparse=always")).unwrap();
        assert_eq!(scripts[copy], "cp -p --sparse=always /data/simg/disk.img /data/dimg/");
        assert_eq!(scripts.last().unwrap(), "umount /data/dimg");
    }

    #[tokio::test]
    async fn test_final_sync_reuses_existing_job() {
        let (source, _, orchestrator) = setup();
        source.add_cronjob("fedora-repl-cronjob");

        orchestrator.run_final_sync(&config(), None).await.unwrap();
        orchestrator.run_final_sync(&config(), None).await.unwrap();
        assert_eq!(source.op_count("create_job_from_cronjob"), 1);
        assert!(source.has_job("fedora-repl-final-job"));
    }

    #[tokio::test]
    async fn test_final_sync_requires_cronjob() {
        let (_, _, orchestrator) = setup();
        assert!(orchestrator.run_final_sync(&config(), None).await.is_err());
    }
}
