//! Submission store
//!
//! Persists immutable [`Submission`] records and exactly one committed
//! [`EvaluationOutcome`] per submission.
//! - [`redis::RedisStore`]: production backend
//! - [`memory::MemoryStore`]: development and tests

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreError;
use crate::languages::Language;
use crate::reducer::EvaluationOutcome;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// One evaluation attempt. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub code: String,
    pub language: Language,
    /// Monotonic per user and challenge
    pub attempt_number: u32,
    pub submitted_at: DateTime<Utc>,
    pub code_digest: String,
}

impl Submission {
    pub fn new(
        challenge_id: Uuid,
        user_id: Uuid,
        code: String,
        language: Language,
        attempt_number: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            challenge_id,
            user_id,
            code_digest: code_digest(&code),
            code,
            language,
            attempt_number,
            submitted_at: Utc::now(),
        }
    }
}

/// Submission with its outcome denormalized onto it once terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    #[serde(flatten)]
    pub submission: Submission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<EvaluationOutcome>,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Atomically bump and return the attempt counter for `user` on `challenge`
    async fn next_attempt_number(&self, user: Uuid, challenge: Uuid) -> Result<u32, StoreError>;

    async fn insert_submission(&self, submission: &Submission) -> Result<(), StoreError>;

    /// Commit the terminal outcome. Only the first commit wins; later ones
    /// return `false` and change nothing.
    async fn commit_outcome(
        &self,
        submission_id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> Result<bool, StoreError>;

    async fn get(&self, submission_id: Uuid) -> Result<Option<SubmissionRecord>, StoreError>;

    /// Close out a submission whose session never started
    async fn mark_errored(&self, submission_id: Uuid, message: &str) -> Result<bool, StoreError> {
        self.commit_outcome(submission_id, &crate::reducer::errored(message))
            .await
    }
}

/// SHA-256 of the submitted code, hex encoded
pub fn code_digest(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}
