//! Error types for virtmigrate
//!
//! Every cluster interaction, template render and sizing step reports
//! failures through [`MigrateError`].

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for virtmigrate operations
pub type Result<T> = std::result::Result<T, MigrateError>;

/// Unified error type for virtmigrate
#[derive(Error, Debug)]
pub enum MigrateError {
    // ===== Configuration Errors =====
    #[error(transparent)]
    Config(#[from] ConfigError),

    // ===== Command Errors =====
    #[error("command execution failed: {program} {args}: {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // ===== Cluster State Errors =====
    #[error("{kind} {name} not found in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },

    #[error("precondition failed: {0}")]
    Precondition(String),

    // ===== Parsing Errors =====
    #[error("parse error: {0}")]
    Parse(String),

    // ===== Template Errors =====
    #[error("template error: {0}")]
    Template(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Wrapped Errors =====
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<MigrateError>,
    },
}

impl MigrateError {
    /// Wraps the error with the name of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        MigrateError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True when the cluster reported that the requested object is absent.
    ///
    /// CLI tools report absence as a failed command whose stderr mentions
    /// `NotFound` / `not found`, so both shapes are accepted.
    pub fn is_not_found(&self) -> bool {
        match self {
            MigrateError::NotFound { .. } => true,
            MigrateError::CommandFailed { stderr, .. } => {
                stderr.contains("NotFound") || stderr.contains("not found")
            }
            MigrateError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Adds `.context(...)` to any `Result<T, MigrateError>`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C, {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display_carries_stderr() {
        let err = MigrateError::CommandFailed {
            program: "oc".to_string(),
            args: "get vm fedora".to_string(),
            status: Some(1),
            stderr: "Error from server (NotFound): virtualmachines \"fedora\" not found".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("command execution failed: oc get vm fedora"));
        assert!(text.contains("NotFound"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_context_preserves_not_found() {
        let err = MigrateError::NotFound {
            kind: "vm".to_string(),
            name: "fedora".to_string(),
            namespace: "default".to_string(),
        }
        .context("failed to read VM status");

        assert_eq!(
            err.to_string(),
            "failed to read VM status: vm fedora not found in namespace default"
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_failures_are_not_not_found() {
        let err = MigrateError::CommandFailed {
            program: "kubectl".to_string(),
            args: "apply".to_string(),
            status: Some(1),
            stderr: "connection refused".to_string(),
        };
        assert!(!err.is_not_found());
        assert!(!MigrateError::Precondition("x".into()).is_not_found());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: MigrateError = io_err.into();
        assert!(matches!(err, MigrateError::Io(_)));
    }

    #[test]
    fn test_result_ext_with_context() {
        let res: Result<()> = Err(MigrateError::Parse("bad".into()));
        let err = res.with_context(|| format!("step {}", 3)).unwrap_err();
        assert_eq!(err.to_string(), "step 3: parse error: bad");
    }
}
