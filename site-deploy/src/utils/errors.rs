//! Error types for the deployment engine.

use crate::session::SessionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Secret store error: {0}")]
    Secret(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to publish remote manifest: {0}")]
    ManifestPublish(String),

    #[error("Cannot write to remote target: {0}")]
    CannotWrite(String),

    #[error("Deployment cancelled")]
    Cancelled,
}

impl DeployError {
    /// Failure class reported to the observer for this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DeployError::Config(_)
            | DeployError::Precondition(_)
            | DeployError::InvalidManifest(_)
            | DeployError::Secret(_) => FailureKind::Precondition,
            DeployError::Session(SessionError::Timeout(_)) => FailureKind::ConnectionTimeout,
            DeployError::Session(e) if e.is_connection_lost() => FailureKind::ConnectionLost,
            DeployError::Session(_) => FailureKind::CannotConnect,
            DeployError::ManifestPublish(_) => FailureKind::ManifestPublish,
            DeployError::CannotWrite(_) => FailureKind::CannotWrite,
            DeployError::Cancelled => FailureKind::Cancelled,
            DeployError::Io(_) | DeployError::Serialization(_) => FailureKind::Internal,
        }
    }
}

/// Failure classes surfaced in terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Precondition,
    CannotConnect,
    ConnectionTimeout,
    ConnectionLost,
    ManifestPublish,
    CannotWrite,
    Cancelled,
    Internal,
}

pub type Result<T> = std::result::Result<T, DeployError>;
