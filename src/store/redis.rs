//! Redis submission store
//!
//! Layout:
//! - `eval:attempts:{user}:{challenge}`: attempt counter (INCR)
//! - `eval:submission:{id}`: submission JSON
//! - `eval:outcome:{id}`: committed outcome JSON, written with SET NX so
//!   only the first commit lands
//!
//! Every committed outcome is also published on `eval:results` for
//! gamification and other subscribers.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Submission, SubmissionRecord, SubmissionStore};
use crate::error::StoreError;
use crate::reducer::EvaluationOutcome;

/// Redis key constants
pub mod keys {
    use uuid::Uuid;

    /// Attempt counter key prefix
    pub const ATTEMPTS_PREFIX: &str = "eval:attempts:";

    /// Submission record key prefix
    pub const SUBMISSION_PREFIX: &str = "eval:submission:";

    /// Committed outcome key prefix
    pub const OUTCOME_PREFIX: &str = "eval:outcome:";

    /// Committed outcome channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "eval:results";

    pub fn attempts(user: Uuid, challenge: Uuid) -> String {
        format!("{}{}:{}", ATTEMPTS_PREFIX, user, challenge)
    }

    pub fn submission(id: Uuid) -> String {
        format!("{}{}", SUBMISSION_PREFIX, id)
    }

    pub fn outcome(id: Uuid) -> String {
        format!("{}{}", OUTCOME_PREFIX, id)
    }
}

/// Message published once per committed outcome
#[derive(Debug, Serialize)]
struct CommittedOutcome<'a> {
    submission_id: Uuid,
    user_id: Uuid,
    challenge_id: Uuid,
    attempt_number: u32,
    outcome: &'a EvaluationOutcome,
}

pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<MultiplexedConnection>,
    ttl_secs: u64,
}

impl RedisStore {
    /// Connect, retrying until redis is reachable
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            conn: Mutex::new(conn),
            ttl_secs,
        })
    }

    /// Run a command, reconnecting once if the connection has gone bad
    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().await.clone();
        match cmd.query_async::<T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_error(&e) => {
                warn!("Redis command failed: {}. Reconnecting...", e);
                let mut fresh = self.client.get_multiplexed_async_connection().await?;
                *self.conn.lock().await = fresh.clone();
                Ok(cmd.query_async::<T>(&mut fresh).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_submission(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        let raw: Option<String> = self.query(redis::cmd("GET").arg(keys::submission(id))).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn next_attempt_number(&self, user: Uuid, challenge: Uuid) -> Result<u32, StoreError> {
        let n: u64 = self
            .query(redis::cmd("INCR").arg(keys::attempts(user, challenge)))
            .await?;
        Ok(n.min(u32::MAX as u64) as u32)
    }

    async fn insert_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let json = serde_json::to_string(submission)?;
        let _: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(keys::submission(submission.id))
                    .arg(&json)
                    .arg("NX")
                    .arg("EX")
                    .arg(self.ttl_secs),
            )
            .await?;
        Ok(())
    }

    async fn commit_outcome(
        &self,
        submission_id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> Result<bool, StoreError> {
        let submission = self
            .load_submission(submission_id)
            .await?
            .ok_or(StoreError::MissingSubmission(submission_id))?;

        let json = serde_json::to_string(outcome)?;
        let claimed: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(keys::outcome(submission_id))
                    .arg(&json)
                    .arg("NX")
                    .arg("EX")
                    .arg(self.ttl_secs),
            )
            .await?;

        if claimed.is_none() {
            debug!("Outcome for {} already committed", submission_id);
            return Ok(false);
        }

        let message = serde_json::to_string(&CommittedOutcome {
            submission_id,
            user_id: submission.user_id,
            challenge_id: submission.challenge_id,
            attempt_number: submission.attempt_number,
            outcome,
        })?;
        // No subscribers is fine
        if let Err(e) = self
            .query::<()>(redis::cmd("PUBLISH").arg(keys::RESULT_CHANNEL).arg(&message))
            .await
        {
            warn!("Failed to publish outcome for {}: {}", submission_id, e);
        }

        Ok(true)
    }

    async fn get(&self, submission_id: Uuid) -> Result<Option<SubmissionRecord>, StoreError> {
        let Some(submission) = self.load_submission(submission_id).await? else {
            return Ok(None);
        };
        let raw: Option<String> = self
            .query(redis::cmd("GET").arg(keys::outcome(submission_id)))
            .await?;
        let outcome = match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Some(SubmissionRecord {
            submission,
            outcome,
        }))
    }
}

fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> MultiplexedConnection {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
