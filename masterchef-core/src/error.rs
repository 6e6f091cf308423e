use serde::Serialize;
use thiserror::Error;

/// Semantic error kinds surfaced by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Conflict,
    Gone,
    Unauthenticated,
    Exhausted,
    ShuttingDown,
    Internal,
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Admission denials carry the deciding gate and its reason.
    #[error("{message}")]
    Conflict {
        message: String,
        gate: Option<String>,
        reason: Option<String>,
    },

    #[error("gone: {0}")]
    Gone(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Exhausted(String),

    #[error("control plane is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            gate: None,
            reason: None,
        }
    }

    /// Denial raised by an admission gate.
    pub fn denied(gate: impl Into<String>, reason: impl Into<String>) -> Self {
        let gate = gate.into();
        let reason = reason.into();
        Self::Conflict {
            message: format!("admission denied by {gate}: {reason}"),
            gate: Some(gate),
            reason: Some(reason),
        }
    }

    pub fn backlog_full(current: usize, max: usize) -> Self {
        Self::Exhausted(format!(
            "BACKLOG_FULL: queue backlog {current} has reached max_backlog {max}"
        ))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Gone(_) => ErrorKind::Gone,
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Exhausted(_) => ErrorKind::Exhausted,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
