//! Analysis-only handlers: supported languages and feedback without a run

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::{AppState, AuthenticatedUser};
use crate::error::SubmitError;
use crate::gateway::AnalyzeRequest;
use crate::languages::{self, Language};
use crate::protocol::Feedback;

#[derive(Debug, Serialize)]
pub struct LanguageInfo {
    id: Language,
    name: &'static str,
    compiled: bool,
    deadline_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct LanguageList {
    languages: Vec<LanguageInfo>,
}

pub async fn languages(State(state): State<Arc<AppState>>) -> Json<LanguageList> {
    let languages = Language::ALL
        .into_iter()
        .map(|language| {
            let config = languages::get_language_config(language);
            LanguageInfo {
                id: language,
                name: language.display_name(),
                compiled: config
                    .as_ref()
                    .is_some_and(|c| c.compile_command.is_some()),
                deadline_secs: state.gateway.deadline_for(language).as_secs(),
                test_timeout_ms: config.map(|c| c.test_timeout_ms),
            }
        })
        .collect();
    Json(LanguageList { languages })
}

pub async fn analyze(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(_): AuthenticatedUser,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<Feedback>, SubmitError> {
    state.gateway.analyze(request).await.map(Json)
}
