// Error taxonomy
//
// Every failure a command or a sweep can hit maps onto one of these variants.
// Remote messages are carried verbatim so operators see what Proxmox said.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ConfirmableAction, ResourceRef};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Proxmox rejected the request: {0}")]
    RemoteRejected(String),

    #[error("Proxmox unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Confirmation for {action} on {resource} expired, reissue the command")]
    ConfirmationExpired {
        resource: ResourceRef,
        action: ConfirmableAction,
    },

    #[error("Confirmation mismatch: {0}")]
    ConfirmationMismatch(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Wire-level discriminant of [`OrchestratorError`], rendered in command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    RemoteRejected,
    RemoteUnavailable,
    PreconditionFailed,
    ConfirmationExpired,
    ConfirmationMismatch,
    Storage,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::RemoteRejected(_) => ErrorKind::RemoteRejected,
            OrchestratorError::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            OrchestratorError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            OrchestratorError::ConfirmationExpired { .. } => ErrorKind::ConfirmationExpired,
            OrchestratorError::ConfirmationMismatch(_) => ErrorKind::ConfirmationMismatch,
            OrchestratorError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only transport-level failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::RemoteUnavailable(_))
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Storage(format!("malformed watch-list data: {}", err))
    }
}
