//! Names of the cluster objects a migration creates
//!
//! Every component derives object names from the VM name alone so that a
//! later run (or cleanup) can find what an earlier run left behind.

/// Mount point of the local disk inside a replicator pod
pub const SOURCE_DATA_DIR: &str = "/data/simg";

/// Mount point of the remote (destination) disk inside the source replicator
pub const REMOTE_DATA_DIR: &str = "/data/dimg";

/// Disk image file inside a KubeVirt filesystem volume
pub const DISK_IMAGE: &str = "disk.img";

/// Object names for one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub vm: String,
    pub source_pod: String,
    pub destination_pod: String,
    pub destination_service: String,
    pub ssh_secret: String,
    pub cronjob: String,
    pub final_job: String,
    pub launcher_prefix: String,
}

impl ResourceNames {
    pub fn for_vm(vm: &str) -> Self {
        Self {
            vm: vm.to_string(),
            source_pod: format!("{vm}-src-replicator"),
            destination_pod: format!("{vm}-dst-replicator"),
            destination_service: format!("{vm}-dst-svc"),
            ssh_secret: format!("{vm}-repl-ssh-keys"),
            cronjob: format!("{vm}-repl-cronjob"),
            final_job: format!("{vm}-repl-final-job"),
            launcher_prefix: format!("virt-launcher-{vm}"),
        }
    }

    /// Claim holding the VM's root disk
    pub fn root_disk_claim(&self) -> &str {
        &self.vm
    }
}
