//! In-process submission store

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{Submission, SubmissionRecord, SubmissionStore};
use crate::error::StoreError;
use crate::reducer::EvaluationOutcome;

#[derive(Default)]
struct Inner {
    attempts: HashMap<(Uuid, Uuid), u32>,
    records: HashMap<Uuid, SubmissionRecord>,
}

/// Store kept entirely in memory; lost on restart
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn next_attempt_number(&self, user: Uuid, challenge: Uuid) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().await;
        let counter = inner.attempts.entry((user, challenge)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.records.entry(submission.id).or_insert_with(|| SubmissionRecord {
            submission: submission.clone(),
            outcome: None,
        });
        Ok(())
    }

    async fn commit_outcome(
        &self,
        submission_id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(&submission_id)
            .ok_or(StoreError::MissingSubmission(submission_id))?;

        if record.outcome.is_some() {
            debug!("Outcome for {} already committed", submission_id);
            return Ok(false);
        }
        record.outcome = Some(outcome.clone());
        Ok(true)
    }

    async fn get(&self, submission_id: Uuid) -> Result<Option<SubmissionRecord>, StoreError> {
        Ok(self.inner.lock().await.records.get(&submission_id).cloned())
    }
}
