//! Submission gateway
//!
//! Synchronous entry point: validates a submission, persists it with its
//! attempt number and opens the evaluation session. A submission whose
//! session cannot be opened is closed out as ERROR before the error is
//! returned, so no record is left without an outcome.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{Challenge, ChallengeCatalog};
use crate::error::SubmitError;
use crate::feedback::AnalysisRequest;
use crate::languages::{self, Language};
use crate::protocol::Feedback;
use crate::reducer::EvaluationOutcome;
use crate::runner::RunJob;
use crate::session::{new_task_id, SessionDeps, SessionRegistry, SessionSpec, SessionTicket};
use crate::store::{Submission, SubmissionRecord, SubmissionStore};

/// Body of `POST /submissions`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(alias = "challenge_id")]
    pub challenge_id: Uuid,
    pub code: String,
    pub language: String,
}

/// Body of `POST /analyze`: feedback only, no tests are run
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub code: String,
    pub language: String,
    #[serde(default, alias = "problem_statement")]
    pub problem_statement: String,
}

/// Returned once the session is running
#[derive(Debug)]
pub struct SubmissionHandle {
    pub submission_id: Uuid,
    pub task_id: String,
    pub attempt_number: u32,
    pub outcome: watch::Receiver<Option<EvaluationOutcome>>,
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayLimits {
    pub max_code_bytes: usize,
    /// Used when the language table sets no deadline
    pub default_deadline: Duration,
}

pub struct SubmissionGateway {
    catalog: Arc<dyn ChallengeCatalog>,
    store: Arc<dyn SubmissionStore>,
    registry: Arc<SessionRegistry>,
    deps: SessionDeps,
    limits: GatewayLimits,
}

impl SubmissionGateway {
    pub fn new(
        catalog: Arc<dyn ChallengeCatalog>,
        registry: Arc<SessionRegistry>,
        deps: SessionDeps,
        limits: GatewayLimits,
    ) -> Self {
        Self {
            catalog,
            store: deps.store.clone(),
            registry,
            deps,
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn submit(
        &self,
        user_id: Uuid,
        request: SubmitRequest,
    ) -> Result<SubmissionHandle, SubmitError> {
        let language = self.validate(&request)?;

        let challenge = self
            .catalog
            .find(request.challenge_id)
            .await
            .ok_or(SubmitError::ChallengeNotFound(request.challenge_id))?;
        if self.catalog.is_locked(&challenge, user_id).await {
            return Err(SubmitError::ChallengeLocked(challenge.id));
        }

        let attempt_number = self
            .store
            .next_attempt_number(user_id, challenge.id)
            .await?;
        let submission = Submission::new(
            challenge.id,
            user_id,
            request.code,
            language,
            attempt_number,
        );
        self.store.insert_submission(&submission).await?;

        info!(
            "Accepted submission {} (user {}, challenge {}, attempt {}, {})",
            submission.id, user_id, challenge.id, attempt_number, language
        );

        let ticket = self.start(&submission, &challenge, new_task_id()).await?;
        Ok(SubmissionHandle {
            submission_id: submission.id,
            task_id: ticket.task_id,
            attempt_number,
            outcome: ticket.outcome,
        })
    }

    fn validate(&self, request: &SubmitRequest) -> Result<Language, SubmitError> {
        self.validate_code(&request.code, &request.language)
    }

    fn validate_code(&self, code: &str, language: &str) -> Result<Language, SubmitError> {
        if code.trim().is_empty() {
            return Err(SubmitError::Validation("code must not be empty".into()));
        }
        if code.len() > self.limits.max_code_bytes {
            return Err(SubmitError::Validation(format!(
                "code exceeds {} bytes",
                self.limits.max_code_bytes
            )));
        }
        language
            .parse::<Language>()
            .map_err(|e| SubmitError::Validation(e.to_string()))
    }

    /// Session deadline for `language`
    pub fn deadline_for(&self, language: Language) -> Duration {
        languages::get_language_config(language)
            .and_then(|config| config.deadline_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.limits.default_deadline)
    }

    /// Feedback for a piece of code without running any tests. Nothing is
    /// persisted.
    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<Feedback, SubmitError> {
        let language = self.validate_code(&request.code, &request.language)?;
        info!("Analyzing {} code ({} bytes)", language, request.code.len());

        let analysis = AnalysisRequest {
            code: request.code,
            language,
            problem_statement: request.problem_statement,
        };
        self.deps
            .feedback
            .produce(&analysis)
            .await
            .ok_or(SubmitError::AnalysisUnavailable)
    }

    /// Open the session for a stored submission, or mark it errored
    async fn start(
        &self,
        submission: &Submission,
        challenge: &Challenge,
        task_id: String,
    ) -> Result<SessionTicket, SubmitError> {
        let deadline = self.deadline_for(submission.language);

        let spec = SessionSpec {
            task_id: task_id.clone(),
            submission_id: submission.id,
            job: RunJob {
                task_id,
                language: submission.language,
                code: submission.code.clone(),
                tests: challenge.tests.clone(),
            },
            analysis: AnalysisRequest {
                code: submission.code.clone(),
                language: submission.language,
                problem_statement: challenge.description.clone(),
            },
            deadline,
            xp_reward: challenge.xp_reward,
        };

        match self.registry.open(spec, &self.deps) {
            Ok(ticket) => Ok(ticket),
            Err(e) => {
                error!(
                    "Failed to open session for submission {}: {}",
                    submission.id, e
                );
                let message = format!("session could not be started: {}", e);
                if let Err(store_err) = self.store.mark_errored(submission.id, &message).await {
                    error!(
                        "Failed to mark submission {} as errored: {}",
                        submission.id, store_err
                    );
                }
                Err(e.into())
            }
        }
    }

    /// The persisted record, with its outcome once committed
    pub async fn find(&self, submission_id: Uuid) -> Result<SubmissionRecord, SubmitError> {
        self.store
            .get(submission_id)
            .await?
            .ok_or(SubmitError::NotFound(submission_id))
    }

    /// Wait up to `wait` for the outcome to be committed. Returns the full
    /// record if it was, `None` if the caller should stream instead.
    pub async fn resolve_fast(
        &self,
        handle: &mut SubmissionHandle,
        wait: Duration,
    ) -> Result<Option<SubmissionRecord>, SubmitError> {
        if wait.is_zero() {
            return Ok(None);
        }
        // The watch::Ref holds a read lock and must not live across an await
        let waited = tokio::time::timeout(wait, handle.outcome.wait_for(|o| o.is_some()))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => self.find(handle.submission_id).await.map(Some),
            Ok(Err(_)) => {
                warn!(
                    "[{}] Session ended without publishing an outcome",
                    handle.task_id
                );
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }
}
