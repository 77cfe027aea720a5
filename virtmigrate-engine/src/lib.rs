//! virtmigrate engine
//!
//! Orchestration of a VM migration between two clusters: cluster access,
//! manifest templates, SSH trust, replication and the feasibility check.

pub mod check;
pub mod cluster;
pub mod controller;
pub mod mount;
pub mod names;
pub mod replicator;
pub mod ssh;
pub mod sync;
pub mod template;
pub mod vm;

pub use check::{CheckEngine, CheckOptions, CheckReport, CheckResults, Probe, ProbeStatus};
pub use cluster::{
    connect, CleanupReport, ClusterClient, ClusterSide, KubeClient, MockCluster, VmStatus,
};
pub use controller::{ControllerOptions, InitSummary, MigrateSummary, MigrationController};
pub use mount::{Endpoint, MountProvider, SshfsMount};
pub use names::ResourceNames;
pub use ssh::SshProvisioner;
pub use sync::{ReplicationJobSpec, SyncOrchestrator};
pub use template::{TemplateKind, TemplateRenderer, TemplateVars};
