//! Durable at-least-once job queue on the database.
//!
//! A claimed job is leased until `leased_until`; if the worker dies the
//! lease lapses and another worker reclaims it. Handlers must therefore be
//! idempotent. Only the worker named in `lease_owner`, on the attempt it
//! claimed, can complete, fail or release a job.

use std::time::Duration;

use async_trait::async_trait;
use certd_db::entities::{
    dead_letter,
    job::{self, JobStatus},
};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::IssuanceError;
use crate::jobs::Job;

/// Candidates inspected per claim attempt
const CLAIM_BATCH: u64 = 8;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} is no longer leased to this worker")]
    LeaseLost(String),
}

/// Retry schedule for failed jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Result of an enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: String,
    /// False when an existing job absorbed the submission
    pub created: bool,
}

/// A job leased to one worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub job: Job,
    /// Including the current attempt
    pub attempts: i32,
    pub version: i64,
    pub subject: Option<String>,
    /// Worker the lease was granted to
    pub owner: String,
}

/// What happened to a failed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { available_at: DateTime<Utc> },
    Failed,
    Dead,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<Enqueued, QueueError>;

    /// Lease the next available job whose kind is in `kinds` to `owner`.
    async fn claim(
        &self,
        kinds: &[&str],
        lease: Duration,
        owner: &str,
    ) -> Result<Option<ClaimedJob>, QueueError>;

    async fn complete(
        &self,
        claimed: &ClaimedJob,
        result: serde_json::Value,
    ) -> Result<(), QueueError>;

    async fn fail(
        &self,
        claimed: &ClaimedJob,
        error: &IssuanceError,
    ) -> Result<FailOutcome, QueueError>;

    /// Give the job back without charging the attempt, for failures that
    /// belong to the worker rather than the job.
    async fn release(&self, claimed: &ClaimedJob, error: &IssuanceError) -> Result<(), QueueError>;

    /// Whether a newer version of `subject` has been enqueued.
    async fn is_superseded(&self, subject: &str, version: i64) -> Result<bool, QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<job::Model>, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

pub struct DbJobQueue {
    db: DatabaseConnection,
    retry: RetryPolicy,
}

impl DbJobQueue {
    pub fn new(db: DatabaseConnection, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<job::Model>, QueueError> {
        Ok(job::Entity::find()
            .filter(job::Column::IdempotencyKey.eq(key))
            .one(&self.db)
            .await?)
    }

    async fn supersede_older(&self, subject: &str, version: i64) -> Result<(), QueueError> {
        let result = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Superseded))
            .col_expr(job::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(job::Column::Subject.eq(subject))
            .filter(job::Column::Version.lt(version))
            .filter(job::Column::Status.eq(JobStatus::Queued))
            .exec(&self.db)
            .await?;
        if result.rows_affected > 0 {
            debug!(subject, superseded = result.rows_affected, "Superseded older jobs");
        }
        Ok(())
    }

    /// Terminal jobs with the given key may be requeued for rerunnable kinds.
    async fn requeue(&self, existing: &job::Model) -> Result<bool, QueueError> {
        let now = Utc::now();
        let result = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Queued))
            .col_expr(job::Column::Attempts, Expr::value(0))
            .col_expr(job::Column::AvailableAt, Expr::value(now))
            .col_expr(job::Column::LeasedUntil, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(job::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(job::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(job::Column::ErrorKind, Expr::value(Option::<String>::None))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(existing.id.as_str()))
            .filter(job::Column::Status.eq(existing.status))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    fn decode(model: &job::Model, owner: &str) -> Result<ClaimedJob, QueueError> {
        let job: Job = serde_json::from_str(&model.payload)?;
        Ok(ClaimedJob {
            id: model.id.clone(),
            job,
            attempts: model.attempts,
            version: model.version,
            subject: model.subject.clone(),
            owner: owner.to_string(),
        })
    }

    /// Rows still running under the given lease
    fn leased(job_id: &str, owner: &str, attempts: i32) -> Condition {
        Condition::all()
            .add(job::Column::Id.eq(job_id))
            .add(job::Column::Status.eq(JobStatus::Running))
            .add(job::Column::LeaseOwner.eq(owner))
            .add(job::Column::Attempts.eq(attempts))
    }

    /// `NotFound` when the row is gone, `LeaseLost` when someone else holds it.
    async fn lease_error(&self, job_id: &str) -> QueueError {
        match job::Entity::find_by_id(job_id.to_string()).one(&self.db).await {
            Ok(Some(_)) => QueueError::LeaseLost(job_id.to_string()),
            Ok(None) => QueueError::NotFound(job_id.to_string()),
            Err(err) => err.into(),
        }
    }

    async fn settle_failure(
        &self,
        job_id: &str,
        owner: &str,
        attempts: i32,
        error: &IssuanceError,
    ) -> Result<FailOutcome, QueueError> {
        let txn = self.db.begin().await?;
        let Some(model) = job::Entity::find()
            .filter(Self::leased(job_id, owner, attempts))
            .one(&txn)
            .await?
        else {
            drop(txn);
            return Err(self.lease_error(job_id).await);
        };
        let now = Utc::now();
        let message = error.to_string();
        let kind = error.kind().as_str().to_string();

        let (status, outcome) = if !error.is_retryable() {
            (JobStatus::Failed, FailOutcome::Failed)
        } else if model.attempts >= self.retry.max_attempts {
            (JobStatus::Dead, FailOutcome::Dead)
        } else {
            let delay = self.retry.backoff(model.attempts);
            let available_at =
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
            (JobStatus::Queued, FailOutcome::Retrying { available_at })
        };

        let available_at = match &outcome {
            FailOutcome::Retrying { available_at } => *available_at,
            _ => model.available_at,
        };

        let updated = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(status))
            .col_expr(job::Column::AvailableAt, Expr::value(available_at))
            .col_expr(job::Column::LeasedUntil, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(job::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(job::Column::LastError, Expr::value(Some(message.clone())))
            .col_expr(job::Column::ErrorKind, Expr::value(Some(kind)))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(Self::leased(job_id, owner, attempts))
            .exec(&txn)
            .await?;
        if updated.rows_affected != 1 {
            return Err(QueueError::LeaseLost(job_id.to_string()));
        }

        if outcome == FailOutcome::Dead {
            let exhausted = IssuanceError::ExhaustedRetries {
                attempts: model.attempts,
                last_error: message.clone(),
            };
            dead_letter::ActiveModel {
                id: Set(uuid::Uuid::new_v4().to_string()),
                job_id: Set(model.id.clone()),
                kind: Set(model.kind.clone()),
                payload: Set(model.payload.clone()),
                error: Set(exhausted.to_string()),
                attempts: Set(model.attempts),
                failed_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await?;

        match &outcome {
            FailOutcome::Retrying { available_at } => {
                info!(job_id, attempts = model.attempts, retry_at = %available_at, error = %message, "Job will be retried")
            }
            FailOutcome::Failed => warn!(job_id, error = %message, "Job failed"),
            FailOutcome::Dead => {
                warn!(job_id, attempts = model.attempts, error = %message, "Job moved to dead letters")
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl JobQueue for DbJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<Enqueued, QueueError> {
        let key = job.idempotency_key();
        let subject = job.subject();

        if let Some(existing) = self.find_by_key(&key).await? {
            let terminal = !matches!(existing.status, JobStatus::Queued | JobStatus::Running);
            if terminal && job.is_rerunnable() && self.requeue(&existing).await? {
                debug!(job_id = %existing.id, key = %key, "Requeued finished job");
                return Ok(Enqueued {
                    job_id: existing.id,
                    created: true,
                });
            }
            return Ok(Enqueued {
                job_id: existing.id,
                created: false,
            });
        }

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let (subject_name, version) = match &subject {
            Some((name, version)) => (Some(name.clone()), *version),
            None => (None, 0),
        };

        let model = job::ActiveModel {
            id: Set(id.clone()),
            kind: Set(job.kind().to_string()),
            payload: Set(serde_json::to_string(job)?),
            idempotency_key: Set(key.clone()),
            subject: Set(subject_name),
            version: Set(version),
            status: Set(JobStatus::Queued),
            attempts: Set(0),
            available_at: Set(now),
            leased_until: Set(None),
            lease_owner: Set(None),
            last_error: Set(None),
            error_kind: Set(None),
            result: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(&self.db).await {
            Ok(_) => {}
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                // Lost the race against an identical submission
                if let Some(existing) = self.find_by_key(&key).await? {
                    return Ok(Enqueued {
                        job_id: existing.id,
                        created: false,
                    });
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        }

        if let Some((name, version)) = &subject {
            self.supersede_older(name, *version).await?;
        }

        debug!(job_id = %id, kind = job.kind(), "Job enqueued");
        Ok(Enqueued {
            job_id: id,
            created: true,
        })
    }

    async fn claim(
        &self,
        kinds: &[&str],
        lease: Duration,
        owner: &str,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        if kinds.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        let leased_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));

        let claimable = Condition::any()
            .add(
                Condition::all()
                    .add(job::Column::Status.eq(JobStatus::Queued))
                    .add(job::Column::AvailableAt.lte(now)),
            )
            .add(
                Condition::all()
                    .add(job::Column::Status.eq(JobStatus::Running))
                    .add(job::Column::LeasedUntil.lt(now)),
            );

        let candidates = job::Entity::find()
            .filter(claimable)
            .filter(job::Column::Kind.is_in(kinds.iter().copied()))
            .order_by_asc(job::Column::AvailableAt)
            .limit(CLAIM_BATCH)
            .all(&self.db)
            .await?;

        for candidate in candidates {
            let result = job::Entity::update_many()
                .col_expr(job::Column::Status, Expr::value(JobStatus::Running))
                .col_expr(job::Column::LeasedUntil, Expr::value(Some(leased_until)))
                .col_expr(job::Column::LeaseOwner, Expr::value(Some(owner.to_string())))
                .col_expr(job::Column::Attempts, Expr::value(candidate.attempts + 1))
                .col_expr(job::Column::UpdatedAt, Expr::value(now))
                .filter(job::Column::Id.eq(candidate.id.as_str()))
                .filter(job::Column::Status.eq(candidate.status))
                .filter(job::Column::Attempts.eq(candidate.attempts))
                .exec(&self.db)
                .await?;
            if result.rows_affected != 1 {
                continue;
            }

            if candidate.status == JobStatus::Running {
                warn!(job_id = %candidate.id, previous_owner = ?candidate.lease_owner, "Reclaimed job with expired lease");
            }

            let mut claimed = candidate;
            claimed.attempts += 1;
            match Self::decode(&claimed, owner) {
                Ok(job) => return Ok(Some(job)),
                Err(err) => {
                    warn!(job_id = %claimed.id, error = %err, "Discarding undecodable job");
                    self.settle_failure(
                        &claimed.id,
                        owner,
                        claimed.attempts,
                        &IssuanceError::Internal(format!("undecodable payload: {}", err)),
                    )
                    .await?;
                }
            }
        }
        Ok(None)
    }

    async fn complete(
        &self,
        claimed: &ClaimedJob,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let updated = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Succeeded))
            .col_expr(job::Column::Result, Expr::value(Some(result.to_string())))
            .col_expr(job::Column::LeasedUntil, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(job::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(Self::leased(&claimed.id, &claimed.owner, claimed.attempts))
            .exec(&self.db)
            .await?;
        if updated.rows_affected != 1 {
            return Err(self.lease_error(&claimed.id).await);
        }
        Ok(())
    }

    async fn fail(
        &self,
        claimed: &ClaimedJob,
        error: &IssuanceError,
    ) -> Result<FailOutcome, QueueError> {
        self.settle_failure(&claimed.id, &claimed.owner, claimed.attempts, error)
            .await
    }

    async fn release(&self, claimed: &ClaimedJob, error: &IssuanceError) -> Result<(), QueueError> {
        let now = Utc::now();
        let updated = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Queued))
            .col_expr(job::Column::Attempts, Expr::value(claimed.attempts - 1))
            .col_expr(job::Column::AvailableAt, Expr::value(now))
            .col_expr(job::Column::LeasedUntil, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(job::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(job::Column::LastError, Expr::value(Some(error.to_string())))
            .col_expr(
                job::Column::ErrorKind,
                Expr::value(Some(error.kind().as_str().to_string())),
            )
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(Self::leased(&claimed.id, &claimed.owner, claimed.attempts))
            .exec(&self.db)
            .await?;
        if updated.rows_affected != 1 {
            return Err(self.lease_error(&claimed.id).await);
        }
        info!(job_id = %claimed.id, owner = %claimed.owner, error = %error, "Job released for another worker");
        Ok(())
    }

    async fn is_superseded(&self, subject: &str, version: i64) -> Result<bool, QueueError> {
        let newer = job::Entity::find()
            .filter(job::Column::Subject.eq(subject))
            .filter(job::Column::Version.gt(version))
            .filter(job::Column::Status.ne(JobStatus::Superseded))
            .one(&self.db)
            .await?;
        Ok(newer.is_some())
    }

    async fn get(&self, job_id: &str) -> Result<Option<job::Model>, QueueError> {
        Ok(job::Entity::find_by_id(job_id.to_string())
            .one(&self.db)
            .await?)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        certd_db::ping(&self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped_exponential() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    async fn queue(retry: RetryPolicy) -> DbJobQueue {
        let db = certd_db::connect("sqlite::memory:").await.unwrap();
        certd_db::migrate(&db).await.unwrap();
        DbJobQueue::new(db, retry)
    }

    fn revoke_job() -> Job {
        Job::Revoke {
            ca_id: "ca".into(),
            serial: 3,
            reason: certd_db::entities::revocation::RevocationReason::Superseded,
        }
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_on_key() {
        let queue = queue(RetryPolicy::default()).await;
        let first = queue.enqueue(&revoke_job()).await.unwrap();
        let second = queue.enqueue(&revoke_job()).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn test_claim_complete() {
        let queue = queue(RetryPolicy::default()).await;
        let enqueued = queue.enqueue(&revoke_job()).await.unwrap();

        assert!(queue
            .claim(&[Job::ISSUE], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .is_none());

        let claimed = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, enqueued.job_id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.job, revoke_job());

        // Leased jobs are not handed out twice
        assert!(queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .is_none());

        queue
            .complete(&claimed, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let row = queue.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let queue = queue(RetryPolicy::default()).await;
        queue.enqueue(&revoke_job()).await.unwrap();

        let first = queue
            .claim(&[Job::REVOKE], Duration::from_millis(0), "worker-a")
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.owner, "worker-b");
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_settle_job() {
        let queue = queue(RetryPolicy::default()).await;
        queue.enqueue(&revoke_job()).await.unwrap();

        let stale = queue
            .claim(&[Job::REVOKE], Duration::from_millis(0), "worker-a")
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-b")
            .await
            .unwrap()
            .unwrap();

        let err = queue
            .complete(&stale, serde_json::json!({"ok": "stale"}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(ref id) if *id == stale.id));
        let err = queue
            .fail(&stale, &IssuanceError::NotFound("serial".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));

        let row = queue.get(&current.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Running);
        assert_eq!(row.lease_owner.as_deref(), Some("worker-b"));
        assert!(row.result.is_none());

        queue
            .complete(&current, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let row = queue.get(&current.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
        assert_eq!(row.result.as_deref(), Some(r#"{"ok":true}"#));
        assert!(row.lease_owner.is_none());

        // Settling twice is refused too
        assert!(matches!(
            queue.complete(&current, serde_json::Value::Null).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_release_does_not_charge_attempt() {
        let queue = queue(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        })
        .await;
        queue.enqueue(&revoke_job()).await.unwrap();

        let claimed = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .unwrap();
        queue
            .release(&claimed, &IssuanceError::KeyUnavailable("ca".into()))
            .await
            .unwrap();

        let row = queue.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.error_kind.as_deref(), Some("key_unavailable"));

        let again = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts, 1);

        // The released lease is gone
        assert!(matches!(
            queue
                .release(&claimed, &IssuanceError::KeyUnavailable("ca".into()))
                .await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let queue = queue(RetryPolicy {
            max_attempts: 2,
            base: Duration::from_millis(0),
            max: Duration::from_millis(0),
        })
        .await;
        queue.enqueue(&revoke_job()).await.unwrap();
        let transient = IssuanceError::TransientDependency("db down".into());

        let claimed = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .unwrap();
        let outcome = queue.fail(&claimed, &transient).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { .. }));

        let claimed = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, 2);
        assert_eq!(queue.fail(&claimed, &transient).await.unwrap(), FailOutcome::Dead);

        let row = queue.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Dead);
        let letters = dead_letter::Entity::find().all(&queue.db).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, claimed.id);
        assert_eq!(letters[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure() {
        let queue = queue(RetryPolicy::default()).await;
        queue.enqueue(&revoke_job()).await.unwrap();
        let claimed = queue
            .claim(&[Job::REVOKE], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .unwrap();
        let outcome = queue
            .fail(&claimed, &IssuanceError::NotFound("serial".into()))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
        let row = queue.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(row.error_kind.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn test_newer_refresh_supersedes_queued_one() {
        let queue = queue(RetryPolicy::default()).await;
        let refresh = |version| Job::RefreshOcsp {
            ca_id: "ca".into(),
            serial: 9,
            status_version: version,
            key_generation: 1,
        };
        let old = queue.enqueue(&refresh(1)).await.unwrap();
        let new = queue.enqueue(&refresh(2)).await.unwrap();

        let old_row = queue.get(&old.job_id).await.unwrap().unwrap();
        assert_eq!(old_row.status, JobStatus::Superseded);
        assert!(queue.is_superseded("ca:9", old_row.version).await.unwrap());

        let new_row = queue.get(&new.job_id).await.unwrap().unwrap();
        assert!(!queue.is_superseded("ca:9", new_row.version).await.unwrap());
    }

    #[tokio::test]
    async fn test_finished_refresh_is_requeued() {
        let queue = queue(RetryPolicy::default()).await;
        let job = Job::RefreshOcsp {
            ca_id: "ca".into(),
            serial: 1,
            status_version: 1,
            key_generation: 1,
        };
        let first = queue.enqueue(&job).await.unwrap();
        let claimed = queue
            .claim(&[Job::REFRESH_OCSP], Duration::from_secs(30), "worker-a")
            .await
            .unwrap()
            .unwrap();
        queue.complete(&claimed, serde_json::Value::Null).await.unwrap();

        let again = queue.enqueue(&job).await.unwrap();
        assert!(again.created);
        assert_eq!(again.job_id, first.job_id);
        let row = queue.get(&first.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
    }
}
