//! Live session registry
//!
//! Indexes running sessions by task id and submission id, hands the event
//! stream to exactly one transport and routes cancel requests. An entry
//! lives as long as its session task. A session that finishes before anyone
//! attached keeps its buffered stream for a retention window, so a client
//! that connects late still receives every event up to the terminal one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use super::{channel, run_session, EventStream, SessionDeps, SessionSpec};
use crate::error::SessionError;
use crate::reducer::EvaluationOutcome;

/// Caller's view of a freshly opened session
#[derive(Debug)]
pub struct SessionTicket {
    pub task_id: String,
    /// Becomes `Some` once the outcome is committed
    pub outcome: watch::Receiver<Option<EvaluationOutcome>>,
}

struct Entry {
    submission_id: Uuid,
    cancel: mpsc::Sender<String>,
    stream: Option<EventStream>,
    outcome: watch::Receiver<Option<EvaluationOutcome>>,
    /// Session ended; only the unattached stream is being kept
    finished: bool,
}

#[derive(Default)]
struct Inner {
    by_task: HashMap<String, Entry>,
    by_submission: HashMap<Uuid, String>,
}

/// How long a finished session waits for its first consumer by default
pub const DEFAULT_STREAM_RETENTION: Duration = Duration::from_secs(60);

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    retention: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_STREAM_RETENTION)
    }
}

/// Removes the session's entry when its task ends, however it ends
struct EntryGuard {
    registry: Arc<SessionRegistry>,
    task_id: String,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let mut inner = self.registry.lock();
        if let Some(entry) = inner.by_task.remove(&self.task_id) {
            inner.by_submission.remove(&entry.submission_id);
        }
        debug!("[{}] Session entry removed", self.task_id);
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: Mutex::default(),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and spawn a session. Fails if the submission already has one.
    pub fn open(
        self: &Arc<Self>,
        spec: SessionSpec,
        deps: &SessionDeps,
    ) -> Result<SessionTicket, SessionError> {
        let (outbox, stream) = channel(deps.outbound_capacity);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        {
            let mut inner = self.lock();
            if inner.by_submission.contains_key(&spec.submission_id)
                || inner.by_task.contains_key(&spec.task_id)
            {
                return Err(SessionError::DuplicateSubmission(spec.submission_id));
            }
            inner
                .by_submission
                .insert(spec.submission_id, spec.task_id.clone());
            inner.by_task.insert(
                spec.task_id.clone(),
                Entry {
                    submission_id: spec.submission_id,
                    cancel: cancel_tx,
                    stream: Some(stream),
                    outcome: outcome_rx.clone(),
                    finished: false,
                },
            );
        }

        let guard = EntryGuard {
            registry: Arc::clone(self),
            task_id: spec.task_id.clone(),
        };
        let task_id = spec.task_id.clone();
        let deps = deps.clone();
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let task_id = spec.task_id.clone();
            run_session(spec, deps, outbox, cancel_rx, outcome_tx).await;
            if registry.hold_unattached(&task_id) {
                tokio::time::sleep(registry.retention).await;
                debug!("[{}] Retention expired without a consumer", task_id);
            }
        });

        Ok(SessionTicket {
            task_id,
            outcome: outcome_rx,
        })
    }

    /// Mark a finished session whose stream nobody took. Returns true if the
    /// entry should be kept for late consumers.
    fn hold_unattached(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.by_task.get_mut(task_id) {
            Some(entry) if entry.stream.is_some() => {
                entry.finished = true;
                debug!(
                    "[{}] Finished before a consumer attached, keeping stream for {}s",
                    task_id,
                    self.retention.as_secs()
                );
                true
            }
            _ => false,
        }
    }

    /// Take the session's event stream. Only the first caller gets it.
    pub fn attach(&self, task_id: &str) -> Result<EventStream, SessionError> {
        let mut inner = self.lock();
        let entry = inner
            .by_task
            .get_mut(task_id)
            .ok_or_else(|| SessionError::UnknownTask(task_id.to_string()))?;
        let stream = entry
            .stream
            .take()
            .ok_or_else(|| SessionError::AlreadyAttached(task_id.to_string()))?;

        if entry.finished {
            let submission_id = entry.submission_id;
            inner.by_task.remove(task_id);
            inner.by_submission.remove(&submission_id);
            info!("[{}] Consumer attached to finished session", task_id);
        } else {
            info!("[{}] Consumer attached", task_id);
        }
        Ok(stream)
    }

    /// Request cancellation. Returns false if a cancel is already in flight
    /// or the session is finishing.
    pub fn cancel(&self, task_id: &str, reason: &str) -> Result<bool, SessionError> {
        let inner = self.lock();
        let entry = inner
            .by_task
            .get(task_id)
            .ok_or_else(|| SessionError::UnknownTask(task_id.to_string()))?;
        let accepted = entry.cancel.try_send(reason.to_string()).is_ok();
        debug!("[{}] Cancel requested ({}), accepted={}", task_id, reason, accepted);
        Ok(accepted)
    }

    pub fn outcome_watch(&self, task_id: &str) -> Option<watch::Receiver<Option<EvaluationOutcome>>> {
        self.lock().by_task.get(task_id).map(|e| e.outcome.clone())
    }

    pub fn task_for_submission(&self, submission_id: Uuid) -> Option<String> {
        self.lock().by_submission.get(&submission_id).cloned()
    }

    /// Number of live sessions
    pub fn active(&self) -> usize {
        self.lock().by_task.values().filter(|e| !e.finished).count()
    }
}
