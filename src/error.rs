//! Error kinds raised by the backend layers.
//!
//! Library functions return [`anyhow::Result`] and attach context with
//! `.with_context(...)`. When a failure belongs to one of the kinds below it
//! is raised as the root error, so callers can classify it with
//! `err.downcast_ref::<BackendError>()` regardless of the context layers on top.

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Unsupported architecture, missing mount source, unusable cache directory.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The upstream index no longer matches the expected snapshot naming.
    #[error("no line in upstream index {url} matches '{pattern}' (did upstream change its naming?)")]
    UpstreamFormat { url: String, pattern: String },

    /// Index or archive transfer failure.
    #[error("transfer of {url} failed: {detail}")]
    Network { url: String, detail: String },

    /// Non-zero exit from the sandboxed package manager.
    #[error("{operation} failed: '{command}' exited with status {exit_code}")]
    Invocation {
        operation: String,
        command: String,
        exit_code: i32,
    },
}

impl BackendError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// A required path does not exist.
    pub fn missing_path(what: &str, path: &Path) -> Self {
        Self::Configuration(format!("{} not found at {}", what, path.display()))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Classify an error chain, if its root is a [`BackendError`].
pub fn kind_of(err: &anyhow::Error) -> Option<&BackendError> {
    err.downcast_ref::<BackendError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_kind_survives_context() {
        let err: anyhow::Result<()> = Err(BackendError::configuration("arch riscv64 unmapped").into());
        let err = err.context("resolving architecture").unwrap_err();

        assert!(kind_of(&err).is_some_and(BackendError::is_configuration));
        assert!(format!("{:#}", err).contains("riscv64"));
    }

    #[test]
    fn test_invocation_message_names_command() {
        let err = BackendError::Invocation {
            operation: "install".into(),
            command: "emerge".into(),
            exit_code: 1,
        };
        assert_eq!(
            err.to_string(),
            "install failed: 'emerge' exited with status 1"
        );
    }
}
