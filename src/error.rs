//! Error types for the controller.

use std::time::Duration;

use thiserror::Error;

/// Failure classes reported by a record store.
///
/// Only [`StoreError::Transient`] is retried automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record store temporarily unavailable: {0}")]
    Transient(String),

    #[error("record store schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("record store rejected the change: {0}")]
    PermanentRejection(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        // Connection, timeout and body errors are all worth another try.
        StoreError::Transient(err.to_string())
    }
}

/// Why the bootstrap gate gave up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("record store schema missing: {0}")]
    SchemaMissing(String),

    #[error("record store unreachable: {0}")]
    Unreachable(String),

    #[error("record store not ready after {0:?}")]
    Timeout(Duration),

    #[error("shutdown requested before the record store became ready")]
    Shutdown,
}

/// Peer artifact write failures.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("peer artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("permission denied writing peer artifact: {0}")]
    PermissionDenied(String),
}

impl WriteError {
    /// Splits permission problems out of plain I/O so they are reported
    /// as such.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            WriteError::PermissionDenied(format!("{}: {}", context, err))
        } else {
            WriteError::Io(std::io::Error::new(err.kind(), format!("{}: {}", context, err)))
        }
    }
}

/// Errors from a pod inventory.  All of them end the current watch and
/// cause a re-list.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("watch stream error: {0}")]
    Watch(String),

    #[error("inventory call timed out after {0:?}")]
    Timeout(Duration),
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read {path}: {source}")]
    SecretFile {
        path: String,
        source: std::io::Error,
    },
}
