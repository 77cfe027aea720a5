//! Replicator pods and the destination service

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use virtmigrate_core::{MigrationConfig, Result, ResultExt};

use crate::cluster::{ClusterClient, ResourceKind};
use crate::names::ResourceNames;
use crate::template::{TemplateKind, TemplateRenderer, TemplateVars};

const RUNNING: &str = "Running";

/// Creates the temporary replicator endpoints on both sides
pub struct Replicators {
    source: Arc<dyn ClusterClient>,
    destination: Arc<dyn ClusterClient>,
    renderer: TemplateRenderer,
}

impl Replicators {
    pub fn new(
        source: Arc<dyn ClusterClient>,
        destination: Arc<dyn ClusterClient>,
        renderer: TemplateRenderer,
    ) -> Self {
        Self {
            source,
            destination,
            renderer,
        }
    }

    /// Source replicator pod, created unless already running.
    pub async fn ensure_source(
        &self,
        config: &MigrationConfig,
        ready_timeout: Duration,
    ) -> Result<()> {
        let names = ResourceNames::for_vm(&config.vm_name);
        let vars = TemplateVars {
            sync_tool: Some(config.sync_backend.name().to_string()),
            ..TemplateVars::new(&config.vm_name, &config.namespace)
        };
        ensure_pod(
            self.source.as_ref(),
            &self.renderer,
            TemplateKind::SourceReplicator,
            &names.source_pod,
            &vars,
            ready_timeout,
        )
        .await
        .context("failed to create source replicator")
    }

    /// Destination replicator pod and its NodePort service.
    pub async fn ensure_destination(
        &self,
        config: &MigrationConfig,
        ready_timeout: Duration,
    ) -> Result<()> {
        let names = ResourceNames::for_vm(&config.vm_name);
        let vars = TemplateVars {
            port: Some(config.ssh_port),
            target_port: Some(config.ssh_port),
            ..TemplateVars::new(&config.vm_name, &config.namespace)
        };

        ensure_pod(
            self.destination.as_ref(),
            &self.renderer,
            TemplateKind::DestinationReplicator,
            &names.destination_pod,
            &vars,
            ready_timeout,
        )
        .await
        .context("failed to create destination replicator")?;

        if self
            .destination
            .resource_exists(ResourceKind::Service, &names.destination_service, &config.namespace)
            .await
            .context("failed to check destination service")?
        {
            info!(service = %names.destination_service, "Destination service already exists");
            return Ok(());
        }
        self.renderer
            .render_and_apply(TemplateKind::DestinationService, &vars, self.destination.as_ref())
            .await
            .context("failed to create destination service")
    }

    /// Both replicators, source first.
    pub async fn ensure_all(
        &self,
        config: &MigrationConfig,
        ready_timeout: Duration,
    ) -> Result<()> {
        self.ensure_source(config, ready_timeout).await?;
        self.ensure_destination(config, ready_timeout).await
    }
}

async fn ensure_pod(
    cluster: &dyn ClusterClient,
    renderer: &TemplateRenderer,
    kind: TemplateKind,
    pod: &str,
    vars: &TemplateVars,
    ready_timeout: Duration,
) -> Result<()> {
    if cluster.pod_status(pod, &vars.namespace).await?.as_deref() == Some(RUNNING) {
        info!(pod, "Replicator pod already running");
        return Ok(());
    }

    renderer.render_and_apply(kind, vars, cluster).await?;
    cluster
        .wait_for_pod(pod, &vars.namespace, "Ready", Some(ready_timeout))
        .await
        .with_context(|| format!("timeout waiting for {}", pod))?;
    info!(pod, "Replicator pod ready");
    Ok(())
}
