//! Destination VM provisioning
//!
//! The destination VM is created from the source definition in halted
//! form so that its disk can be written before it ever boots.

use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use virtmigrate_core::{MigrateError, MigrationConfig, Result, ResultExt};

use crate::cluster::{ClusterClient, VmInterface, VmStatus};

/// Annotation read by Calico IPAM to pin the pod IP
pub const STATIC_IP_ANNOTATION: &str = "cni.projectcalico.org/ipAddrs";

/// Server-populated metadata that must not be replayed into another cluster
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
    "ownerReferences",
];

const SERVER_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "kubevirt.io/latest-observed-api-version",
    "kubevirt.io/storage-observed-api-version",
];

/// What [`ensure_destination_vm`] found or did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationVm {
    /// Imported from the source definition during this run
    Created,
    /// Already present with the given status
    Existing(VmStatus),
}

/// Turn an exported source definition into a halted, importable one.
///
/// With `interface`, the source instance's IP and MAC are pinned on the
/// pod template so the destination comes up with the same addresses.
pub fn prepare_halted_definition(source: &Value, interface: Option<&VmInterface>) -> Result<Value> {
    let mut definition = source.clone();
    let root = definition
        .as_object_mut()
        .ok_or_else(|| MigrateError::Parse("VM definition is not an object".to_string()))?;

    root.remove("status");

    if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        for key in SERVER_METADATA {
            metadata.remove(*key);
        }
        if let Some(annotations) = metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            for key in SERVER_ANNOTATIONS {
                annotations.remove(*key);
            }
        }
    }

    let spec = root
        .get_mut("spec")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| MigrateError::Precondition("VM definition has no spec".to_string()))?;

    if spec.contains_key("runStrategy") {
        spec.insert("runStrategy".into(), Value::String("Halted".into()));
    } else {
        spec.insert("running".into(), Value::Bool(false));
    }

    if let Some(interface) = interface {
        pin_addresses(spec, interface);
    }

    Ok(definition)
}

fn pin_addresses(spec: &mut Map<String, Value>, interface: &VmInterface) {
    let template = spec
        .entry("template")
        .or_insert_with(|| Value::Object(Map::new()));

    if let Some(ip) = &interface.ip_address {
        if let Some(template) = template.as_object_mut() {
            let metadata = template
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(metadata) = metadata.as_object_mut() {
                let annotations = metadata
                    .entry("annotations")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(annotations) = annotations.as_object_mut() {
                    annotations.insert(
                        STATIC_IP_ANNOTATION.to_string(),
                        Value::String(format!("[\"{}\"]", ip)),
                    );
                }
            }
        }
    }

    if let Some(mac) = &interface.mac_address {
        match template.pointer_mut("/spec/domain/devices/interfaces/0") {
            Some(Value::Object(first)) => {
                first.insert("macAddress".into(), Value::String(mac.clone()));
            }
            _ => warn!(mac = %mac, "VM template declares no interface, MAC not pinned"),
        }
    }
}

/// Make sure the destination VM exists in halted form.
///
/// An absent VM is exported from the source, halted, imported and waited on
/// until `Stopped`. With `enforce_halted`, an existing VM that is not
/// stopped is stopped and waited on as well.
pub async fn ensure_destination_vm(
    source: &dyn ClusterClient,
    destination: &dyn ClusterClient,
    config: &MigrationConfig,
    enforce_halted: bool,
    timeout: Duration,
) -> Result<DestinationVm> {
    let vm = config.vm_name.as_str();
    let namespace = config.namespace.as_str();

    if let Some(status) = destination
        .find_vm_status(vm, namespace)
        .await
        .context("failed to read destination VM status")?
    {
        info!(vm, status = %status, "VM already exists in destination cluster");
        if enforce_halted && status != VmStatus::Stopped {
            destination
                .stop_vm(vm, namespace)
                .await
                .context("failed to stop VM in destination cluster")?;
            destination
                .wait_for_vm_status(vm, namespace, &VmStatus::Stopped, timeout)
                .await
                .context("destination VM failed to reach Stopped state")?;
        }
        return Ok(DestinationVm::Existing(status));
    }

    info!(vm, "VM not found in destination cluster, creating it in halted state");
    let exported = source
        .export_vm(vm, namespace)
        .await
        .context("failed to export VM from source cluster")?;

    let interface = if config.preserve_ip {
        let interface = source
            .vm_interface(vm, namespace)
            .await
            .context("failed to read source VM addresses")?;
        if interface.is_none() {
            warn!(vm, "Source VM instance not running, addresses cannot be preserved");
        }
        interface
    } else {
        None
    };

    let definition = prepare_halted_definition(&exported, interface.as_ref())?;
    destination
        .import_vm(&definition, namespace)
        .await
        .context("failed to import VM to destination cluster")?;

    destination
        .wait_for_vm_status(vm, namespace, &VmStatus::Stopped, timeout)
        .await
        .context("destination VM failed to reach Stopped state")?;

    info!(vm, "Destination VM created in halted state");
    Ok(DestinationVm::Created)
}
