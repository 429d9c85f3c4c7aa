//! Error types for the Dockyard controller

use std::fmt;

use thiserror::Error;

/// Coarse classification of [`DockyardError`] visible to callers outside the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Decryption,
    HostUnreachable,
    PermissionDenied,
    Conflict,
    AuditPersistence,
    NotFound,
    Validation,
    Docker,
    Git,
    Storage,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Decryption => "decryption",
            ErrorKind::HostUnreachable => "host_unreachable",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Conflict => "conflict",
            ErrorKind::AuditPersistence => "audit_persistence",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Docker => "docker",
            ErrorKind::Git => "git",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Main error type for the Dockyard controller
#[derive(Error, Debug)]
pub enum DockyardError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unable to decrypt secret: {0}")]
    DecryptionError(String),

    #[error("Host unreachable: {host}")]
    HostUnreachable { host: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The paired action was rolled back; the detail is only logged
    #[error("Operation failed")]
    AuditPersistence,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Docker rejected the request: {0}")]
    DockerError(String),

    #[error("Git checkout failed: {0}")]
    GitError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DockyardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DockyardError::ConfigError(_) => ErrorKind::Configuration,
            DockyardError::DecryptionError(_) => ErrorKind::Decryption,
            DockyardError::HostUnreachable { .. } => ErrorKind::HostUnreachable,
            DockyardError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            DockyardError::Conflict(_) => ErrorKind::Conflict,
            DockyardError::AuditPersistence => ErrorKind::AuditPersistence,
            DockyardError::NotFound(_) => ErrorKind::NotFound,
            DockyardError::ValidationError(_) => ErrorKind::Validation,
            DockyardError::DockerError(_) => ErrorKind::Docker,
            DockyardError::GitError(_) => ErrorKind::Git,
            DockyardError::IoError(_)
            | DockyardError::JsonError(_)
            | DockyardError::StorageError(_) => ErrorKind::Storage,
            DockyardError::ShutdownError(_) | DockyardError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn host_unreachable(host: impl Into<String>) -> Self {
        DockyardError::HostUnreachable { host: host.into() }
    }
}
