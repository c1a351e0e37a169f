//! Evaluation session
//!
//! One task per submission. It fans runner and feedback output into a single
//! ordered [`Outbox`], enforces the deadline, honors cancellation, folds
//! every emitted event through the [`Reducer`] and commits the terminal
//! outcome exactly once before delivering the terminal event.
//!
//! The runner and feedback invocations run as their own tasks and are
//! aborted when the session reaches a terminal state.

mod outbox;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EvaluationError;
use crate::feedback::{AnalysisRequest, FeedbackAggregator};
use crate::protocol::{Event, Feedback, RunSummary};
use crate::reducer::{EvaluationOutcome, Reducer};
use crate::runner::{RunJob, RunnerEvent, TestRunner};
use crate::scoring::ScoringPolicy;
use crate::store::SubmissionStore;

pub use outbox::{channel, EventStream, Outbox};
pub use registry::{SessionRegistry, SessionTicket};

/// Buffered runner events between the runner task and the session
const RUNNER_CHANNEL_CAPACITY: usize = 64;

/// Reason reported when the transport closes before the terminal event
pub const DISCONNECT_REASON: &str = "client disconnected";

/// Reason reported for an explicit cancel
pub const CANCEL_REASON: &str = "cancelled by client";

/// Everything specific to one session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub task_id: String,
    pub submission_id: Uuid,
    pub job: RunJob,
    pub analysis: AnalysisRequest,
    pub deadline: Duration,
    pub xp_reward: u32,
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionDeps {
    pub runner: Arc<dyn TestRunner>,
    pub feedback: Arc<FeedbackAggregator>,
    pub policy: Arc<dyn ScoringPolicy>,
    pub store: Arc<dyn SubmissionStore>,
    pub outbound_capacity: usize,
    pub feedback_grace: Duration,
}

/// How the select loop ended
#[derive(Debug)]
enum Termination {
    Completed(RunSummary),
    Failed(EvaluationError),
    Cancelled(String),
}

/// Aborts the runner and feedback invocations when dropped
struct InvocationGuard {
    tasks: Vec<AbortHandle>,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Emits events in order while keeping the server-side fold current
struct Emitter {
    reducer: Reducer,
    outcome: EvaluationOutcome,
    outbox: Outbox,
}

impl Emitter {
    fn emit(&mut self, event: Event) {
        self.outcome = self.reducer.reduce(std::mem::take(&mut self.outcome), &event);
        self.outbox.push(event);
    }
}

/// Drive one session to its terminal state
pub(crate) async fn run_session(
    spec: SessionSpec,
    deps: SessionDeps,
    outbox: Outbox,
    mut cancel_rx: mpsc::Receiver<String>,
    outcome_tx: watch::Sender<Option<EvaluationOutcome>>,
) {
    let SessionSpec {
        task_id,
        submission_id,
        job,
        analysis,
        deadline,
        xp_reward,
    } = spec;

    info!(
        "[{}] Session started for submission {} ({}, {} tests, deadline {}s)",
        task_id,
        submission_id,
        job.language,
        job.tests.len(),
        deadline.as_secs()
    );

    let mut emitter = Emitter {
        reducer: Reducer::new(deps.policy.clone(), xp_reward).tracking(task_id.clone()),
        outcome: EvaluationOutcome::default(),
        outbox,
    };
    emitter.emit(Event::TaskId {
        task_id: task_id.clone(),
    });

    let (runner_tx, mut runner_rx) = mpsc::channel(RUNNER_CHANNEL_CAPACITY);
    let runner = deps.runner.clone();
    let runner_task = tokio::spawn(async move {
        if let Err(e) = runner.run(&job, runner_tx.clone()).await {
            let _ = runner_tx.send(RunnerEvent::Crashed(format!("{:#}", e))).await;
        }
    });

    let (feedback_tx, mut feedback_rx) = oneshot::channel::<Feedback>();
    let aggregator = deps.feedback.clone();
    let feedback_task = tokio::spawn(async move {
        if let Some(feedback) = aggregator.produce(&analysis).await {
            let _ = feedback_tx.send(feedback);
        }
    });

    let guard = InvocationGuard {
        tasks: vec![runner_task.abort_handle(), feedback_task.abort_handle()],
    };

    let deadline_at = Instant::now() + deadline;
    let deadline_timer = tokio::time::sleep_until(deadline_at);
    let grace_timer = tokio::time::sleep_until(deadline_at);
    tokio::pin!(deadline_timer, grace_timer);

    let mut runner_open = true;
    let mut feedback_pending = true;
    let mut pending_summary: Option<RunSummary> = None;

    let termination = loop {
        tokio::select! {
            biased;

            Some(reason) = cancel_rx.recv() => break Termination::Cancelled(reason),

            () = &mut deadline_timer => match pending_summary {
                Some(summary) => break Termination::Completed(summary),
                None => break Termination::Failed(EvaluationError::Timeout(deadline.as_secs())),
            },

            event = runner_rx.recv(), if runner_open => match event {
                Some(RunnerEvent::Status(content)) => emitter.emit(Event::Status { content }),
                Some(RunnerEvent::Test(test)) => emitter.emit(Event::TestResult(test.redacted())),
                Some(RunnerEvent::Summary(summary)) => {
                    if !feedback_pending || deps.feedback_grace.is_zero() {
                        break Termination::Completed(summary);
                    }
                    debug!("[{}] Run finished, waiting for feedback", task_id);
                    runner_open = false;
                    pending_summary = Some(summary);
                    grace_timer
                        .as_mut()
                        .reset((Instant::now() + deps.feedback_grace).min(deadline_at));
                }
                Some(RunnerEvent::Crashed(message)) => {
                    break Termination::Failed(EvaluationError::Runner(message))
                }
                None => break Termination::Failed(EvaluationError::RunnerDisconnected),
            },

            received = &mut feedback_rx, if feedback_pending => {
                feedback_pending = false;
                match received {
                    Ok(feedback) => emitter.emit(Event::Feedback(feedback)),
                    Err(_) => debug!("[{}] No feedback produced", task_id),
                }
                if let Some(summary) = pending_summary {
                    break Termination::Completed(summary);
                }
            },

            () = &mut grace_timer, if pending_summary.is_some() => {
                warn!("[{}] Feedback not ready within grace period, finishing without it", task_id);
                if let Some(summary) = pending_summary {
                    break Termination::Completed(summary);
                }
            },
        }
    };

    // Reclaim runner resources before anything else
    drop(guard);
    drop(cancel_rx);

    let terminal = match termination {
        Termination::Completed(summary) => Event::Result(summary),
        Termination::Failed(err) => {
            warn!(
                "[{}] Evaluation failed ({}): {}",
                task_id,
                err.kind(),
                err
            );
            Event::Error {
                content: err.to_string(),
            }
        }
        Termination::Cancelled(reason) => {
            info!("[{}] Session cancelled: {}", task_id, reason);
            Event::Cancelled { reason }
        }
    };

    let Emitter {
        reducer,
        outcome,
        outbox,
    } = emitter;
    let outcome = reducer.reduce(outcome, &terminal);

    match deps.store.commit_outcome(submission_id, &outcome).await {
        Ok(true) => {}
        Ok(false) => warn!(
            "[{}] Outcome for submission {} was already committed",
            task_id, submission_id
        ),
        Err(e) => error!(
            "[{}] Failed to commit outcome for submission {}: {}",
            task_id, submission_id, e
        ),
    }

    info!(
        "[{}] Session for submission {} finished: {} ({} events dropped)",
        task_id,
        submission_id,
        outcome.status,
        outbox.dropped()
    );

    outcome_tx.send_replace(Some(outcome));
    if !outbox.finish(terminal) {
        debug!("[{}] No consumer for terminal event", task_id);
    }
}

/// Correlation token for a new session
pub fn new_task_id() -> String {
    format!("eval_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TestCase;
    use crate::feedback::FeedbackAnalyzer;
    use crate::languages::Language;
    use crate::protocol::TestOutcome;
    use crate::reducer::{fold_stream, EvaluationStatus};
    use crate::scoring::ThresholdPolicy;
    use crate::store::{MemoryStore, Submission};
    use async_trait::async_trait;

    /// Runner that replays a fixed script, one event per `step`
    struct ScriptedRunner {
        script: Vec<RunnerEvent>,
        step: Duration,
        /// Never finish after the script
        hang: bool,
        fail_with: Option<&'static str>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<RunnerEvent>) -> Self {
            Self {
                script,
                step: Duration::from_millis(10),
                hang: false,
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl TestRunner for ScriptedRunner {
        async fn run(&self, _job: &RunJob, events: mpsc::Sender<RunnerEvent>) -> anyhow::Result<()> {
            for event in &self.script {
                tokio::time::sleep(self.step).await;
                events
                    .send(event.clone())
                    .await
                    .map_err(|_| anyhow::anyhow!("session gone"))?;
            }
            if let Some(message) = self.fail_with {
                anyhow::bail!(message);
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    struct DelayedAnalyzer {
        delay: Duration,
        score: u32,
    }

    #[async_trait]
    impl FeedbackAnalyzer for DelayedAnalyzer {
        async fn analyze(&self, _request: &AnalysisRequest) -> anyhow::Result<Feedback> {
            tokio::time::sleep(self.delay).await;
            Ok(Feedback {
                overall_score: self.score,
                ..Default::default()
            })
        }
    }

    fn test_event(name: &str, passed: bool) -> RunnerEvent {
        RunnerEvent::Test(TestOutcome {
            name: name.into(),
            passed,
            expected_output: Some("3".into()),
            actual_output: Some(if passed { "3" } else { "4" }.into()),
            error_message: None,
            is_hidden: false,
        })
    }

    fn summary(passed: u32, total: u32) -> RunnerEvent {
        RunnerEvent::Summary(RunSummary {
            success: passed == total,
            passed_tests: passed,
            total_tests: total,
            execution_time_ms: Some(5),
        })
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        deps: SessionDeps,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new(runner: ScriptedRunner, feedback_delay: Duration) -> Self {
            let store = Arc::new(MemoryStore::new());
            let deps = SessionDeps {
                runner: Arc::new(runner),
                feedback: Arc::new(FeedbackAggregator::new(Some(Arc::new(DelayedAnalyzer {
                    delay: feedback_delay,
                    score: 80,
                })))),
                policy: Arc::new(ThresholdPolicy::default()),
                store: store.clone(),
                outbound_capacity: 64,
                feedback_grace: Duration::from_secs(5),
            };
            Self {
                registry: Arc::new(SessionRegistry::new()),
                deps,
                store,
            }
        }

        async fn open(&self, deadline: Duration) -> (SessionTicket, Uuid) {
            let submission = Submission::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "console.log(3)".into(),
                Language::Javascript,
                1,
            );
            self.store.insert_submission(&submission).await.unwrap();

            let task_id = new_task_id();
            let spec = SessionSpec {
                task_id: task_id.clone(),
                submission_id: submission.id,
                job: RunJob {
                    task_id,
                    language: Language::Javascript,
                    code: submission.code.clone(),
                    tests: vec![TestCase {
                        name: "Test 1".into(),
                        input: "1 2".into(),
                        expected_output: "3".into(),
                        is_hidden: false,
                    }],
                },
                analysis: AnalysisRequest {
                    code: submission.code.clone(),
                    language: Language::Javascript,
                    problem_statement: "Sum".into(),
                },
                deadline,
                xp_reward: 100,
            };
            let ticket = self.registry.open(spec, &self.deps).unwrap();
            (ticket, submission.id)
        }

        fn reducer(&self, task_id: &str) -> Reducer {
            Reducer::new(self.deps.policy.clone(), 100).tracking(task_id)
        }
    }

    async fn collect(stream: &mut EventStream) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_passing_run_streams_then_commits_passed() {
        let runner = ScriptedRunner::new(vec![
            test_event("Test 1", true),
            test_event("Test 2", true),
            test_event("Test 3", true),
            summary(3, 3),
        ]);
        let harness = Harness::new(runner, Duration::from_millis(15));
        let (ticket, submission_id) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();

        let events = collect(&mut stream).await;
        assert_eq!(
            kinds(&events),
            vec!["task_id", "test_result", "feedback", "test_result", "test_result", "result"]
        );

        let outcome = harness
            .reducer(&ticket.task_id)
            .fold(EvaluationOutcome::default(), &events);
        assert_eq!(outcome.status, EvaluationStatus::Passed);
        assert_eq!(outcome.test_outcomes.len(), 3);
        assert_eq!(outcome.xp_gained, Some(100));

        let record = harness.store.get(submission_id).await.unwrap().unwrap();
        assert_eq!(record.outcome, Some(outcome));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_crash_ends_in_error() {
        let runner = ScriptedRunner::new(vec![RunnerEvent::Crashed("runner crashed".into())]);
        let harness = Harness::new(runner, Duration::from_secs(1));
        let (ticket, _) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();

        let outcome = fold_stream(&harness.reducer(&ticket.task_id), &mut stream).await;
        assert_eq!(outcome.status, EvaluationStatus::Error);
        assert_eq!(outcome.error_message.as_deref(), Some("runner crashed"));
        assert!(outcome.test_outcomes.is_empty());
        assert_eq!(outcome.xp_gained, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_error_return_is_a_crash() {
        let mut runner = ScriptedRunner::new(vec![test_event("Test 1", true)]);
        runner.fail_with = Some("sandbox exploded");
        let harness = Harness::new(runner, Duration::from_secs(1));
        let (ticket, _) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();

        let outcome = fold_stream(&harness.reducer(&ticket.task_id), &mut stream).await;
        assert_eq!(outcome.status, EvaluationStatus::Error);
        assert_eq!(outcome.error_message.as_deref(), Some("sandbox exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_closing_without_summary_is_disconnect() {
        let runner = ScriptedRunner::new(vec![test_event("Test 1", true)]);
        let harness = Harness::new(runner, Duration::from_secs(1));
        let (ticket, _) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();

        let outcome = fold_stream(&harness.reducer(&ticket.task_id), &mut stream).await;
        assert_eq!(outcome.status, EvaluationStatus::Error);
        assert_eq!(outcome.error_message.as_deref(), Some("runner disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_once_as_timeout() {
        let mut runner = ScriptedRunner::new(vec![RunnerEvent::Status("Running Test 1...".into())]);
        runner.hang = true;
        let harness = Harness::new(runner, Duration::from_secs(1));
        let (ticket, submission_id) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();

        let started = Instant::now();
        let events = collect(&mut stream).await;
        assert!(started.elapsed() >= Duration::from_secs(30));

        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(
            terminals[0],
            &Event::Error {
                content: "evaluation timed out after 30s".into()
            }
        );

        let record = harness.store.get(submission_id).await.unwrap().unwrap();
        assert_eq!(record.outcome.unwrap().status, EvaluationStatus::Error);
        assert_eq!(harness.registry.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_first_test_result() {
        let mut runner = ScriptedRunner::new(vec![test_event("Test 1", true)]);
        runner.hang = true;
        let harness = Harness::new(runner, Duration::from_secs(60));
        let (ticket, submission_id) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();
        let reducer = harness.reducer(&ticket.task_id);

        let mut outcome = EvaluationOutcome::default();
        while outcome.test_outcomes.is_empty() {
            let event = stream.recv().await.unwrap();
            outcome = reducer.reduce(outcome, &event);
        }
        outcome = reducer.cancel_requested(outcome);
        assert!(harness
            .registry
            .cancel(&ticket.task_id, CANCEL_REASON)
            .unwrap());

        while let Some(event) = stream.recv().await {
            outcome = reducer.reduce(outcome, &event);
        }
        assert_eq!(outcome.status, EvaluationStatus::Cancelled);
        assert_eq!(outcome.xp_gained, None);

        // A stray result for the same task changes nothing
        let stray = Event::Result(RunSummary {
            success: true,
            passed_tests: 1,
            total_tests: 1,
            execution_time_ms: None,
        });
        assert_eq!(reducer.reduce(outcome.clone(), &stray), outcome);

        let committed = harness.store.get(submission_id).await.unwrap().unwrap();
        assert_eq!(committed.outcome.unwrap().status, EvaluationStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_waits_for_late_feedback() {
        let runner = ScriptedRunner::new(vec![test_event("Test 1", true), summary(1, 1)]);
        let harness = Harness::new(runner, Duration::from_secs(2));
        let (ticket, _) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();

        let events = collect(&mut stream).await;
        assert_eq!(
            kinds(&events),
            vec!["task_id", "test_result", "feedback", "result"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_feedback_is_skipped_after_grace() {
        let runner = ScriptedRunner::new(vec![test_event("Test 1", false), summary(0, 1)]);
        let harness = Harness::new(runner, Duration::from_secs(20));
        let (ticket, _) = harness.open(Duration::from_secs(30)).await;
        let mut stream = harness.registry.attach(&ticket.task_id).unwrap();

        let started = Instant::now();
        let events = collect(&mut stream).await;
        assert_eq!(kinds(&events), vec!["task_id", "test_result", "result"]);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattached_session_still_commits() {
        let runner = ScriptedRunner::new(vec![test_event("Test 1", true), summary(1, 1)]);
        let harness = Harness::new(runner, Duration::from_millis(1));
        let (mut ticket, submission_id) = harness.open(Duration::from_secs(30)).await;

        tokio_test::assert_ok!(ticket.outcome.wait_for(|o| o.is_some()).await);
        let record = harness.store.get(submission_id).await.unwrap().unwrap();
        assert_eq!(record.outcome.unwrap().status, EvaluationStatus::Passed);
    }

    #[test]
    fn test_task_ids_are_unique_and_prefixed() {
        let a = new_task_id();
        let b = new_task_id();
        assert!(a.starts_with("eval_"));
        assert_eq!(a.len(), "eval_".len() + 32);
        assert_ne!(a, b);
    }
}
