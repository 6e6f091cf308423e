use axum::{
    Json,
    extract::{FromRequest, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use masterchef_core::{ControlError, ErrorKind};
use serde_json::{Map, Value};
use std::fmt;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Deciding rule of an admission denial.
    pub reason: Option<String>,
    pub gate: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            reason: None,
            gate: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("error".into(), Value::String(self.message));
        if let Some(reason) = self.reason {
            body.insert("reason".into(), Value::String(reason));
        }
        if let Some(gate) = self.gate {
            body.insert("gate".into(), Value::String(gate));
        }
        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        let status = match err.kind() {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::Exhausted => StatusCode::CONFLICT,
            ErrorKind::Gone => StatusCode::GONE,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => {
                error!(error = %err, "control plane failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        match err {
            ControlError::Conflict {
                message,
                gate,
                reason,
            } => Self {
                status,
                message,
                reason,
                gate,
            },
            other => Self::new(status, other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

/// `Json` extractor whose rejections use the API error body.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_errors_map_to_status_codes() {
        let cases = [
            (ControlError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (ControlError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ControlError::conflict("x"), StatusCode::CONFLICT),
            (ControlError::backlog_full(1, 1), StatusCode::CONFLICT),
            (ControlError::Gone("x".into()), StatusCode::GONE),
            (ControlError::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (ControlError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (ControlError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn denials_keep_gate_and_reason() {
        let err = AppError::from(ControlError::denied("freeze", "change freeze active"));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.gate.as_deref(), Some("freeze"));
        assert_eq!(err.reason.as_deref(), Some("change freeze active"));
    }
}
