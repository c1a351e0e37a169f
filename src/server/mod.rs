//! HTTP surface
//!
//! - `POST /submissions`: submit code for evaluation
//! - `GET /submissions/{id}`: persisted record (recovery path)
//! - `POST /sessions/{task_id}/cancel`: cancel over REST
//! - `GET /sessions/{task_id}/events`: WebSocket event stream
//! - `POST /analyze`: feedback only, no tests are run
//! - `GET /languages`: supported languages
//! - `GET /health`: liveness

mod analysis;
mod stream;
mod submissions;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::gateway::SubmissionGateway;

/// Header set by the authenticating proxy
pub const USER_HEADER: &str = "x-user-id";

pub struct AppState {
    pub gateway: SubmissionGateway,
    /// Zero disables the synchronous fast path
    pub fast_path_wait: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submissions", post(submissions::create))
        .route("/submissions/{id}", get(submissions::get_one))
        .route("/sessions/{task_id}/cancel", post(stream::cancel))
        .route("/sessions/{task_id}/events", get(stream::events))
        .route("/analyze", post(analysis::analyze))
        .route("/languages", get(analysis::languages))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": state.gateway.registry().active(),
    }))
}

/// Caller identity, as asserted by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let unauthorized = |message: &str| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": message })),
            )
        };

        let value = parts
            .headers
            .get(USER_HEADER)
            .ok_or_else(|| unauthorized("authentication required"))?;
        let raw = value
            .to_str()
            .map_err(|_| unauthorized("invalid user id"))?;
        Uuid::parse_str(raw.trim())
            .map(AuthenticatedUser)
            .map_err(|_| unauthorized("invalid user id"))
    }
}
