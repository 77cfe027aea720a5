//! Manifest templates
//!
//! Four templates describe every object the migration creates. They ship
//! embedded in the binary; a directory passed to [`TemplateRenderer::new`]
//! may override any of them with `<id>.yaml`.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use virtmigrate_core::{MigrateError, ResourceProfile, Result, ResultExt};

use crate::cluster::ClusterClient;

/// Allow-listed template identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    SourceReplicator,
    DestinationReplicator,
    DestinationService,
    ReplicationJob,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 4] = [
        TemplateKind::SourceReplicator,
        TemplateKind::DestinationReplicator,
        TemplateKind::DestinationService,
        TemplateKind::ReplicationJob,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            TemplateKind::SourceReplicator => "src-repl",
            TemplateKind::DestinationReplicator => "dst-repl",
            TemplateKind::DestinationService => "dst-repl-svc",
            TemplateKind::ReplicationJob => "src-cronjob",
        }
    }

    fn embedded(&self) -> &'static str {
        match self {
            TemplateKind::SourceReplicator => include_str!("../templates/src-repl.yaml"),
            TemplateKind::DestinationReplicator => include_str!("../templates/dst-repl.yaml"),
            TemplateKind::DestinationService => include_str!("../templates/dst-repl-svc.yaml"),
            TemplateKind::ReplicationJob => include_str!("../templates/src-cronjob.yaml"),
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for TemplateKind {
    type Err = MigrateError;

    fn from_str(id: &str) -> Result<Self> {
        TemplateKind::ALL
            .into_iter()
            .find(|kind| kind.id() == id)
            .ok_or_else(|| MigrateError::Template(format!("invalid template kind: {}", id)))
    }
}

/// Values substituted into a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    pub vm_name: String,
    pub namespace: String,
    pub port: Option<u16>,
    pub target_port: Option<u16>,
    pub schedule: Option<String>,
    /// Base64-encoded replication script
    pub replication_command: Option<String>,
    pub sync_tool: Option<String>,
    pub resources: Option<ResourceProfile>,
}

impl TemplateVars {
    pub fn new(vm_name: &str, namespace: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    fn replacements(&self) -> Vec<(&'static str, String)> {
        let port = |p: Option<u16>| p.map(|p| p.to_string()).unwrap_or_default();
        let text = |s: &Option<String>| s.clone().unwrap_or_default();
        let resources = self.resources.clone().unwrap_or_default();

        vec![
            ("${VM_NAME}", self.vm_name.clone()),
            ("${NAMESPACE}", self.namespace.clone()),
            ("${PORT}", port(self.port)),
            ("${TARGET_PORT}", port(self.target_port)),
            ("${SCHEDULE}", text(&self.schedule)),
            ("${REPLICATION_COMMAND}", text(&self.replication_command)),
            ("${SYNC_TOOL}", text(&self.sync_tool)),
            ("${CPU_LIMIT}", resources.cpu_limit),
            ("${CPU_REQUEST}", resources.cpu_request),
            ("${MEMORY_LIMIT}", resources.memory_limit),
            ("${MEMORY_REQUEST}", resources.memory_request),
        ]
    }
}

/// Renders templates and applies them to a cluster
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    override_dir: Option<PathBuf>,
}

impl TemplateRenderer {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self { override_dir }
    }

    /// Raw template text for an allow-listed id.
    pub fn source(&self, id: &str) -> Result<Cow<'static, str>> {
        let kind: TemplateKind = id.parse()?;

        let Some(dir) = &self.override_dir else {
            return Ok(Cow::Borrowed(kind.embedded()));
        };

        let path = template_path(dir, id)?;
        if !path.exists() {
            debug!(template = id, dir = %dir.display(), "No override, using embedded template");
            return Ok(Cow::Borrowed(kind.embedded()));
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            MigrateError::Template(format!("failed to read template {}: {}", path.display(), e))
        })?;
        Ok(Cow::Owned(content))
    }

    /// Substitute every placeholder; leftovers are an error.
    pub fn render(&self, kind: TemplateKind, vars: &TemplateVars) -> Result<String> {
        let mut rendered = self.source(kind.id())?.into_owned();
        for (placeholder, value) in vars.replacements() {
            rendered = rendered.replace(placeholder, &value);
        }

        if let Some(start) = rendered.find("${") {
            let end = rendered[start..]
                .find('}')
                .map(|i| start + i + 1)
                .unwrap_or(rendered.len());
            return Err(MigrateError::Template(format!(
                "unresolved placeholder {} in template {}",
                &rendered[start..end],
                kind
            )));
        }
        Ok(rendered)
    }

    /// Render `kind` and apply it in `vars.namespace` on `target`.
    pub async fn render_and_apply(
        &self,
        kind: TemplateKind,
        vars: &TemplateVars,
        target: &dyn ClusterClient,
    ) -> Result<()> {
        let manifest = self.render(kind, vars)?;
        target
            .apply_manifest(&manifest, &vars.namespace)
            .await
            .with_context(|| format!("failed to apply template {}", kind))?;
        info!(
            template = %kind,
            vm = %vars.vm_name,
            namespace = %vars.namespace,
            "Applied template"
        );
        Ok(())
    }
}

/// `<dir>/<id>.yaml`, refusing ids that could escape `dir`.
fn template_path(dir: &Path, id: &str) -> Result<PathBuf> {
    let filename = format!("{}.yaml", id);
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(MigrateError::Template(format!(
            "invalid template filename: {}",
            filename
        )));
    }
    Ok(dir.join(filename))
}
