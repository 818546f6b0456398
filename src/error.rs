//! Error types for the orchestrator and its collaborators

use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

use crate::registry::WorkerStatus;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry file {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("config store I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config file {path:?} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid field path '{path}' in section {section}")]
    InvalidPath { section: String, path: String },
}

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("missing credential '{field}' in section {section}")]
    MissingCredential { section: String, field: String },

    #[error("invalid value for {section}.{field}: {reason}")]
    InvalidValue {
        section: String,
        field: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("worker {name} is already {status}")]
    AlreadyRunning {
        name: String,
        status: WorkerStatus,
        pid: Option<u32>,
    },

    #[error("worker {name} is not running (status: {status})")]
    NotRunning { name: String, status: WorkerStatus },

    #[error("failed to launch worker {name}: {source}")]
    LaunchFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("missing credential '{field}' in section {section}")]
    MissingCredential {
        section: String,
        field: String,
        status: WorkerStatus,
    },

    #[error("failed to stop worker {name}: {reason}")]
    StopFailed {
        name: String,
        reason: String,
        status: WorkerStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("log I/O error for worker {name}: {source}")]
    Logs {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Structured error body handed to the HTTP layer
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkerStatus>,
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::UnknownWorker(_) => "unknown_worker",
            OrchestratorError::AlreadyRunning { .. } => "already_running",
            OrchestratorError::NotRunning { .. } => "not_running",
            OrchestratorError::LaunchFailed { .. } => "launch_failed",
            OrchestratorError::MissingCredential { .. } => "missing_credential",
            OrchestratorError::StopFailed { .. } => "stop_failed",
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::Registry(_)
            | OrchestratorError::Store(_)
            | OrchestratorError::Logs { .. } => "internal",
        }
    }

    /// Worker status after the failed operation, when the error is about a known worker
    pub fn status(&self) -> Option<WorkerStatus> {
        match self {
            OrchestratorError::AlreadyRunning { status, .. }
            | OrchestratorError::NotRunning { status, .. }
            | OrchestratorError::MissingCredential { status, .. }
            | OrchestratorError::StopFailed { status, .. } => Some(*status),
            OrchestratorError::LaunchFailed { .. } => Some(WorkerStatus::Stopped),
            _ => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Registry(_)
                | OrchestratorError::Store(_)
                | OrchestratorError::Logs { .. }
        )
    }

    /// Convert into the body surfaced to callers. Internal faults are logged
    /// here in full and replaced by a generic message.
    pub fn to_body(&self) -> ErrorBody {
        let message = if self.is_internal() {
            error!("Internal orchestrator failure: {:?}", self);
            "internal error".to_string()
        } else {
            self.to_string()
        };

        ErrorBody {
            code: self.code(),
            message,
            status: self.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actionable_errors_are_verbatim() {
        let err = OrchestratorError::AlreadyRunning {
            name: "news_collection".to_string(),
            status: WorkerStatus::Running,
            pid: Some(42),
        };
        let body = err.to_body();
        assert_eq!(body.code, "already_running");
        assert_eq!(body.status, Some(WorkerStatus::Running));
        assert!(body.message.contains("news_collection"));
    }

    #[test]
    fn test_internal_errors_are_generic() {
        let err = OrchestratorError::Registry(RegistryError::Io {
            path: PathBuf::from("/var/lib/shepherd/registry.json"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        });
        let body = err.to_body();
        assert_eq!(body.code, "internal");
        assert_eq!(body.message, "internal error");
        assert!(!body.message.contains("registry.json"));
    }

    #[test]
    fn test_launch_failure_reports_stopped() {
        let err = OrchestratorError::LaunchFailed {
            name: "row_deletion".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.status(), Some(WorkerStatus::Stopped));
        let json = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(json["status"], "stopped");
    }
}
