use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{lifecycle::LifecycleError, models::SubmissionKind, sandbox::ContainerError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("another submission is already running for this user")]
    ConcurrentSubmission,
    #[error("no graded attempts remaining")]
    NoAttemptsRemaining,
    #[error("the assignment is not accepting graded submissions")]
    TaskInactive,
    #[error("task has no {} command", .0.as_str())]
    CommandUnsupported(SubmissionKind),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("submission not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ConcurrentSubmission => "concurrent_submission",
            EngineError::NoAttemptsRemaining => "no_attempts_remaining",
            EngineError::TaskInactive => "task_inactive",
            EngineError::CommandUnsupported(_) => "command_unsupported",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::NotFound => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::ConcurrentSubmission | EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::NoAttemptsRemaining
            | EngineError::TaskInactive
            | EngineError::CommandUnsupported(_) => StatusCode::FORBIDDEN,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound => StatusCode::NOT_FOUND,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<LifecycleError> for EngineError {
    fn from(value: LifecycleError) -> Self {
        Self::Conflict(value.to_string())
    }
}

impl From<ContainerError> for EngineError {
    fn from(value: ContainerError) -> Self {
        Self::Internal(value.to_string())
    }
}
