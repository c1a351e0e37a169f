//! Result reducer
//!
//! Pure fold of the ordered event stream into one [`EvaluationOutcome`]. The
//! session runs it on the server to decide what to persist; consumers run it
//! to drive their view. Rules:
//! - nothing changes an outcome once it is terminal
//! - `test_result` with a known test name replaces the earlier entry
//! - only the first `feedback` is kept
//! - `status` is progress text only

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::{Event, Feedback, RunSummary, TestOutcome};
use crate::scoring::ScoringPolicy;
use crate::session::EventStream;

/// Message used when a stream ends without a terminal event
pub const DISCONNECTED_MESSAGE: &str = "connection closed before evaluation finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Partial,
    Error,
    Cancelled,
}

impl EvaluationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EvaluationStatus::Pending | EvaluationStatus::Running)
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvaluationStatus::Pending => "PENDING",
            EvaluationStatus::Running => "RUNNING",
            EvaluationStatus::Passed => "PASSED",
            EvaluationStatus::Failed => "FAILED",
            EvaluationStatus::Partial => "PARTIAL",
            EvaluationStatus::Error => "ERROR",
            EvaluationStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Reduced view of one evaluation. Only produced by folding events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub task_id: Option<String>,
    pub status: EvaluationStatus,
    /// Latest advisory status text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default)]
    pub test_outcomes: Vec<TestOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    /// Set once, only for PASSED, FAILED and PARTIAL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xp_gained: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Local cancel awaiting server confirmation
    #[serde(default)]
    pub cancel_requested: bool,
}

impl EvaluationOutcome {
    pub fn passed_count(&self) -> usize {
        self.test_outcomes.iter().filter(|t| t.passed).count()
    }
}

/// Folds events for one session
#[derive(Clone)]
pub struct Reducer {
    tracked_task: Option<String>,
    policy: Arc<dyn ScoringPolicy>,
    xp_reward: u32,
}

impl Reducer {
    pub fn new(policy: Arc<dyn ScoringPolicy>, xp_reward: u32) -> Self {
        Self {
            tracked_task: None,
            policy,
            xp_reward,
        }
    }

    /// Only bind to `task_id`; any other `task_id` frame is cross-talk
    pub fn tracking(mut self, task_id: impl Into<String>) -> Self {
        self.tracked_task = Some(task_id.into());
        self
    }

    pub fn reduce(&self, outcome: EvaluationOutcome, event: &Event) -> EvaluationOutcome {
        let mut next = outcome;

        if next.status.is_terminal() {
            debug!(
                "Discarding {} event after terminal status {}",
                event.kind(),
                next.status
            );
            return next;
        }

        match event {
            Event::TaskId { task_id } => {
                if let Some(expected) = &self.tracked_task {
                    if expected != task_id {
                        warn!(
                            "Ignoring task_id {} while tracking {}",
                            task_id, expected
                        );
                        return next;
                    }
                }
                match &next.task_id {
                    None => next.task_id = Some(task_id.clone()),
                    Some(bound) if bound != task_id => {
                        warn!("Ignoring task_id {}, already bound to {}", task_id, bound);
                    }
                    Some(_) => {}
                }
            }
            Event::Status { content } => {
                next.progress = Some(content.clone());
                mark_running(&mut next);
            }
            Event::TestResult(test) => {
                match next.test_outcomes.iter_mut().find(|t| t.name == test.name) {
                    Some(existing) => *existing = test.clone(),
                    None => next.test_outcomes.push(test.clone()),
                }
                mark_running(&mut next);
            }
            Event::Feedback(feedback) => match &next.feedback {
                None => next.feedback = Some(feedback.clone()),
                Some(existing) if existing == feedback => {}
                Some(_) => warn!(
                    "Protocol violation: second feedback for task {:?} ignored",
                    next.task_id
                ),
            },
            Event::Result(summary) => {
                let status = match self.policy.classify(summary) {
                    status @ (EvaluationStatus::Passed
                    | EvaluationStatus::Failed
                    | EvaluationStatus::Partial) => status,
                    other => {
                        warn!(
                            "Scoring policy classified a completed run as {}, using FAILED",
                            other
                        );
                        EvaluationStatus::Failed
                    }
                };
                next.status = status;
                next.summary = Some(*summary);
                next.score = Some(self.policy.score(summary));
                next.xp_gained = Some(self.policy.xp(status, summary, self.xp_reward));
            }
            Event::Error { content } => apply_error(&mut next, content),
            Event::Cancelled { reason } => {
                next.status = EvaluationStatus::Cancelled;
                next.progress = Some(reason.clone());
            }
        }

        next
    }

    /// Fold a whole sequence from `outcome`
    pub fn fold<'a>(
        &self,
        outcome: EvaluationOutcome,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> EvaluationOutcome {
        events
            .into_iter()
            .fold(outcome, |acc, event| self.reduce(acc, event))
    }

    /// Record a local cancel request. The status only changes when the
    /// server's `cancelled` event is folded.
    pub fn cancel_requested(&self, outcome: EvaluationOutcome) -> EvaluationOutcome {
        let mut next = outcome;
        if !next.status.is_terminal() {
            next.cancel_requested = true;
        }
        next
    }

    /// Close out a stream that ended. A non-terminal outcome becomes ERROR.
    pub fn finish(&self, outcome: EvaluationOutcome) -> EvaluationOutcome {
        let mut next = outcome;
        if !next.status.is_terminal() {
            warn!(
                "Stream for task {:?} ended without a terminal event",
                next.task_id
            );
            apply_error(&mut next, DISCONNECTED_MESSAGE);
        }
        next
    }
}

/// Outcome for an evaluation that failed before any event was produced
pub fn errored(message: &str) -> EvaluationOutcome {
    let mut outcome = EvaluationOutcome::default();
    apply_error(&mut outcome, message);
    outcome
}

/// Drain `stream` through `reducer` until it ends
pub async fn fold_stream(reducer: &Reducer, stream: &mut EventStream) -> EvaluationOutcome {
    let mut outcome = EvaluationOutcome::default();
    while let Some(event) = stream.recv().await {
        outcome = reducer.reduce(outcome, &event);
    }
    reducer.finish(outcome)
}

fn mark_running(outcome: &mut EvaluationOutcome) {
    if outcome.status == EvaluationStatus::Pending {
        outcome.status = EvaluationStatus::Running;
    }
}

fn apply_error(outcome: &mut EvaluationOutcome, message: &str) {
    outcome.status = EvaluationStatus::Error;
    outcome.error_message = Some(message.to_string());
    outcome.xp_gained = None;
}
