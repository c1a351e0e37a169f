//! Submission handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use super::{AppState, AuthenticatedUser};
use crate::error::SubmitError;
use crate::gateway::SubmitRequest;
use crate::reducer::EvaluationStatus;
use crate::store::SubmissionRecord;

/// 202 body while the evaluation is still running
#[derive(Debug, Serialize)]
struct Accepted {
    id: Uuid,
    task_id: String,
    status: EvaluationStatus,
    attempt_number: u32,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, SubmitError> {
    let gateway = &state.gateway;
    let mut handle = gateway.submit(user_id, request).await?;

    if let Some(record) = gateway
        .resolve_fast(&mut handle, state.fast_path_wait)
        .await?
    {
        return Ok((StatusCode::OK, Json(record)).into_response());
    }

    let body = Accepted {
        id: handle.submission_id,
        task_id: handle.task_id,
        status: EvaluationStatus::Pending,
        attempt_number: handle.attempt_number,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmissionRecord>, SubmitError> {
    let record = state.gateway.find(id).await?;
    // Other users' submissions do not exist as far as the caller knows
    if record.submission.user_id != user_id {
        return Err(SubmitError::NotFound(id));
    }
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{state, CHALLENGE};
    use std::time::Duration;

    fn request(code: &str) -> SubmitRequest {
        SubmitRequest {
            challenge_id: CHALLENGE,
            code: code.into(),
            language: "javascript".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_returns_accepted_while_running() {
        let state = state(true, Duration::ZERO);
        let user = Uuid::new_v4();

        let response = create(
            State(state.clone()),
            AuthenticatedUser(user),
            Json(request("console.log('ok')")),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.gateway.registry().active(), 1);
    }

    /// Handlers are spawned onto the runtime, so their futures must be Send
    fn spawnable<F: std::future::Future + Send>(future: F) -> F {
        future
    }

    #[tokio::test]
    async fn test_create_fast_path_returns_record() {
        let state = state(false, Duration::from_secs(5));
        let user = Uuid::new_v4();

        let response = spawnable(create(
            State(state.clone()),
            AuthenticatedUser(user),
            Json(request("console.log('ok')")),
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_maps_validation_to_422() {
        let state = state(false, Duration::ZERO);
        let result = create(
            State(state),
            AuthenticatedUser(Uuid::new_v4()),
            Json(request("")),
        )
        .await;
        let Err(err) = result else {
            panic!("empty code was accepted");
        };
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_one_hides_other_users_submissions() {
        let state = state(true, Duration::ZERO);
        let owner = Uuid::new_v4();
        let handle = state
            .gateway
            .submit(owner, request("console.log('ok')"))
            .await
            .unwrap();

        let Json(record) = get_one(
            State(state.clone()),
            AuthenticatedUser(owner),
            Path(handle.submission_id),
        )
        .await
        .unwrap();
        assert_eq!(record.submission.attempt_number, 1);
        assert!(record.outcome.is_none());

        let err = get_one(
            State(state),
            AuthenticatedUser(Uuid::new_v4()),
            Path(handle.submission_id),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
