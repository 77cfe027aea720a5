//! Remote filesystem mount between the replicator pods
//!
//! The source replicator mounts the destination replicator's data directory
//! over SSHFS, reaching it through the destination service's NodePort on
//! the destination pod's host IP.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use virtmigrate_core::{MigrateError, MigrationConfig, Result, ResultExt};

use crate::cluster::ClusterClient;
use crate::names::{ResourceNames, DISK_IMAGE, REMOTE_DATA_DIR, SOURCE_DATA_DIR};

/// Marker reported when the NodePort cannot be reached from the source pod
pub const TCP_FAILURE_MARKER: &str = "TCP connectivity test failed";

/// Marker reported when the source data directory is not writable
pub const WRITE_FAILURE_MARKER: &str = "Source directory write permission check failed";

/// Marker reported when the sshfs binary is missing from the source pod
pub const TOOL_MISSING_MARKER: &str = "SSHFS command not available";

/// Where the destination replicator's SSH daemon is reachable from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host_ip: String,
    pub node_port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host_ip, self.node_port)
    }
}

/// Case-insensitive check for one of the marker phrases in an error chain
pub fn has_marker(error: &MigrateError, marker: &str) -> bool {
    error
        .to_string()
        .to_lowercase()
        .contains(&marker.to_lowercase())
}

/// Mount operations driven from the source replicator
#[async_trait]
pub trait MountProvider: Send + Sync {
    /// Probe TCP reachability, source write access and tool presence.
    ///
    /// All three probes run; the error names every failed one by marker.
    async fn check_connectivity(&self, config: &MigrationConfig, endpoint: &Endpoint) -> Result<()>;

    /// Mount the remote directory unless it is already mounted.
    async fn mount(&self, config: &MigrationConfig, endpoint: &Endpoint) -> Result<()>;

    /// Confirm the remote disk image is visible through the mount.
    async fn verify_mount(&self, config: &MigrationConfig) -> Result<()>;

    async fn unmount(&self, config: &MigrationConfig) -> Result<()>;
}

/// SSHFS mount executed inside the source replicator pod
pub struct SshfsMount {
    source: Arc<dyn ClusterClient>,
}

impl SshfsMount {
    pub fn new(source: Arc<dyn ClusterClient>) -> Self {
        Self { source }
    }

    async fn exec(&self, config: &MigrationConfig, script: &str) -> Result<String> {
        let names = ResourceNames::for_vm(&config.vm_name);
        self.source
            .exec_in_pod(&names.source_pod, &config.namespace, script)
            .await
    }

    async fn check_tcp(&self, config: &MigrationConfig, endpoint: &Endpoint) -> Option<String> {
        let script = format!(
            "timeout 5 bash -c '</dev/tcp/{}/{}' && echo 'Connection successful'",
            endpoint.host_ip, endpoint.node_port
        );
        match self.exec(config, &script).await {
            Ok(out) if out.contains("Connection successful") => None,
            Ok(out) => Some(format!("{}: {}", TCP_FAILURE_MARKER, out.trim())),
            Err(e) => Some(format!("{}: {}", TCP_FAILURE_MARKER, e)),
        }
    }

    async fn check_write(&self, config: &MigrationConfig) -> Option<String> {
        let probe = format!("{}/test_write_perm", SOURCE_DATA_DIR);
        let script = format!(
            "mkdir -p {} && touch {} && rm {}",
            SOURCE_DATA_DIR, probe, probe
        );
        self.exec(config, &script)
            .await
            .err()
            .map(|e| format!("{}: {}", WRITE_FAILURE_MARKER, e))
    }

    async fn check_tool(&self, config: &MigrationConfig) -> Option<String> {
        match self.exec(config, "which sshfs || echo 'sshfs not found'").await {
            Ok(out) if out.contains("not found") || out.trim().is_empty() => {
                Some(TOOL_MISSING_MARKER.to_string())
            }
            Ok(_) => None,
            Err(e) => Some(format!("{}: {}", TOOL_MISSING_MARKER, e)),
        }
    }
}

#[async_trait]
impl MountProvider for SshfsMount {
    async fn check_connectivity(
        &self,
        config: &MigrationConfig,
        endpoint: &Endpoint,
    ) -> Result<()> {
        info!(
            vm = %config.vm_name,
            endpoint = %endpoint,
            "Checking connectivity from source replicator"
        );

        let failures: Vec<String> = [
            self.check_tcp(config, endpoint).await,
            self.check_write(config).await,
            self.check_tool(config).await,
        ]
        .into_iter()
        .flatten()
        .collect();

        if failures.is_empty() {
            debug!(vm = %config.vm_name, "Connectivity checks passed");
            return Ok(());
        }
        for failure in &failures {
            warn!(vm = %config.vm_name, failure = %failure, "Connectivity check failed");
        }
        Err(MigrateError::Precondition(failures.join("; ")))
    }

    async fn mount(&self, config: &MigrationConfig, endpoint: &Endpoint) -> Result<()> {
        let script = format!(
            "mountpoint -q {remote} || (mkdir -p {remote} && sshfs -o StrictHostKeyChecking=no -o port={port} {host}:{source} {remote})",
            remote = REMOTE_DATA_DIR,
            port = endpoint.node_port,
            host = endpoint.host_ip,
            source = SOURCE_DATA_DIR,
        );
        self.exec(config, &script)
            .await
            .with_context(|| format!("failed to mount {} at {}", endpoint, REMOTE_DATA_DIR))?;
        info!(vm = %config.vm_name, endpoint = %endpoint, "Mounted destination data directory");
        Ok(())
    }

    async fn verify_mount(&self, config: &MigrationConfig) -> Result<()> {
        let listing = self
            .exec(config, &format!("ls -la {}", REMOTE_DATA_DIR))
            .await
            .context("failed to list mounted directory")?;
        if !listing.contains(DISK_IMAGE) {
            return Err(MigrateError::Precondition(format!(
                "{} not visible under {}",
                DISK_IMAGE, REMOTE_DATA_DIR
            )));
        }
        Ok(())
    }

    async fn unmount(&self, config: &MigrationConfig) -> Result<()> {
        self.exec(config, &format!("umount {}", REMOTE_DATA_DIR))
            .await
            .with_context(|| format!("failed to unmount {}", REMOTE_DATA_DIR))?;
        info!(vm = %config.vm_name, "Unmounted destination data directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use virtmigrate_core::MigrationSettings;

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

    fn endpoint() -> Endpoint {
        Endpoint {
            host_ip: "10.0.0.10".into(),
            node_port: 30022,
        }
    }

    fn setup() -> (Arc<MockCluster>, SshfsMount) {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_pod("fedora-src-replicator", "Running");
        let mount = SshfsMount::new(cluster.clone());
        (cluster, mount)
    }

    #[tokio::test]
    async fn test_connectivity_all_probes_pass() {
        let (cluster, mount) = setup();
        cluster.on_exec("/dev/tcp", "Connection successful\n");
        cluster.on_exec("which sshfs", "/usr/bin/sshfs\n");

        mount.check_connectivity(&config(), &endpoint()).await.unwrap();
        let scripts: Vec<_> = cluster.execs().into_iter().map(|(_, s)| s).collect();
        assert!(scripts[0].contains("/dev/tcp/10.0.0.10/30022"));
        assert!(scripts[1].contains("touch /data/simg/test_write_perm"));
    }

    #[tokio::test]
    async fn test_missing_tool_reported_alone() {
        let (cluster, mount) = setup();
        cluster.on_exec("/dev/tcp", "Connection successful\n");
        cluster.on_exec("which sshfs", "sshfs not found\n");

        let err = mount.check_connectivity(&config(), &endpoint()).await.unwrap_err();
        assert!(has_marker(&err, TOOL_MISSING_MARKER));
        assert!(!has_marker(&err, TCP_FAILURE_MARKER));
        assert!(!has_marker(&err, WRITE_FAILURE_MARKER));
    }

    #[tokio::test]
    async fn test_every_failure_named() {
        let (cluster, mount) = setup();
        cluster.fail_exec("test_write_perm", "Read-only file system");

        let err = mount.check_connectivity(&config(), &endpoint()).await.unwrap_err();
        assert!(has_marker(&err, TCP_FAILURE_MARKER));
        assert!(has_marker(&err, WRITE_FAILURE_MARKER));
        assert!(has_marker(&err, TOOL_MISSING_MARKER));
    }

    #[test]
    fn test_marker_match_ignores_case() {
        let err = MigrateError::Precondition("tcp CONNECTIVITY test failed: refused".into());
        assert!(has_marker(&err, TCP_FAILURE_MARKER));
    }

    #[tokio::test]
    async fn test_mount_is_guarded_and_verified() {
        let (cluster, mount) = setup();
        cluster.on_exec("ls -la", "total 8\n-rw-r--r-- 1 root root 1024 disk.img\n");

        mount.mount(&config(), &endpoint()).await.unwrap();
        mount.verify_mount(&config()).await.unwrap();

        let (_, script) = &cluster.execs()[0];
        assert!(script.starts_with("mountpoint -q /data/dimg ||"));
        assert!(script.contains("-o port=30022 10.0.0.10:/data/simg /data/dimg"));
    }

    #[tokio::test]
    async fn test_verify_requires_disk_image() {
        let (cluster, mount) = setup();
        cluster.on_exec("ls -la", "total 0\n");
        assert!(mount.verify_mount(&config()).await.is_err());
    }
}
