//! Error taxonomy
//!
//! - [`SubmitError`]: synchronous gateway failures, mapped to HTTP responses
//! - [`SessionError`]: session registry misuse
//! - [`StoreError`]: persistence failures
//! - [`EvaluationError`]: terminal failures of a running evaluation, surfaced
//!   to the client as an `error` event

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("challenge {0} not found")]
    ChallengeNotFound(Uuid),

    #[error("challenge {0} is locked")]
    ChallengeLocked(Uuid),

    #[error("submission {0} not found")]
    NotFound(Uuid),

    #[error("code analysis is unavailable")]
    AnalysisUnavailable,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SubmitError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubmitError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SubmitError::ChallengeNotFound(_) | SubmitError::NotFound(_) => StatusCode::NOT_FOUND,
            SubmitError::ChallengeLocked(_) => StatusCode::FORBIDDEN,
            SubmitError::AnalysisUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Store(_) | SubmitError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("submission {0} already has an active session")]
    DuplicateSubmission(Uuid),

    #[error("unknown task id {0}")]
    UnknownTask(String),

    #[error("task {0} already has a consumer attached")]
    AlreadyAttached(String),
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self {
            SessionError::DuplicateSubmission(_) | SessionError::AlreadyAttached(_) => {
                StatusCode::CONFLICT
            }
            SessionError::UnknownTask(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("submission {0} does not exist")]
    MissingSubmission(Uuid),
}

/// Why an evaluation ended in ERROR
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    /// Sandbox crash, unsupported language, compile failure, infra fault
    #[error("{0}")]
    Runner(String),

    #[error("evaluation timed out after {0}s")]
    Timeout(u64),

    #[error("runner disconnected")]
    RunnerDisconnected,
}

impl EvaluationError {
    /// Tag used in logs to tell timeouts apart from runner faults
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluationError::Runner(_) => "runner_error",
            EvaluationError::Timeout(_) => "timeout",
            EvaluationError::RunnerDisconnected => "runner_disconnected",
        }
    }
}
