use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use meetq_queue::backend::validate_enqueue;
use meetq_queue::job::deadline_after;
use meetq_queue::{
    EnqueueOptions, FailDecision, JobEntry, JobId, JobStatus, JobStore, JobType, QueueError,
    QueueStats, RetryPolicies,
};

const CLAIMABLE: &str = "('pending', 'delayed', 'retry-scheduled')";
const LIVE: &str = "('pending', 'delayed', 'active', 'retry-scheduled')";

/// Durable job store using SQLite
///
/// Timestamps are stored as integer milliseconds since the epoch so that
/// `available_at <= now` compares numerically.
pub struct SqliteJobStore {
    pool: SqlitePool,
    policies: RetryPolicies,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_policies(pool, RetryPolicies::default())
    }

    pub fn with_policies(pool: SqlitePool, policies: RetryPolicies) -> Self {
        Self { pool, policies }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, id: JobId) -> Result<Option<JobEntry>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(row_to_entry).transpose()
    }

    /// Why a fenced update on `id` matched no row.
    async fn rejection(&self, id: JobId, worker_id: &str) -> QueueError {
        match self.fetch(id).await {
            Ok(None) => QueueError::NotFound(id),
            Ok(Some(job)) if job.status != JobStatus::Active => QueueError::InvalidTransition {
                id,
                from: job.status,
            },
            Ok(Some(job)) if job.locked_by.as_deref() != Some(worker_id) => {
                QueueError::LeaseLost(id)
            }
            // Matched on re-read: the row changed between the two statements
            Ok(Some(_)) => QueueError::LeaseLost(id),
            Err(e) => e,
        }
    }

    /// Record a failed attempt on a job currently held by `holder`.
    ///
    /// The update only applies while the row is still active under the same
    /// holder (and, when given, the same lease deadline), so a concurrent
    /// heartbeat or completion wins over it.
    async fn apply_failure(
        &self,
        job: &JobEntry,
        holder: &str,
        lease_fence: Option<DateTime<Utc>>,
        error: &str,
        retryable: bool,
    ) -> Result<Option<FailDecision>, QueueError> {
        let now = Utc::now();
        let policy = self.policies.for_type(job.job_type);
        let attempts = job.attempts + 1;

        let decision = if retryable && policy.should_retry(attempts, job.max_attempts) {
            let delay = policy.next_delay(attempts);
            debug!(
                job_id = %job.id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Re-queuing job with backoff"
            );
            FailDecision::Retry {
                attempts,
                available_at: deadline_after(now, delay),
            }
        } else {
            FailDecision::Failed { attempts }
        };

        let available_at = match decision {
            FailDecision::Retry { available_at, .. } => available_at,
            FailDecision::Failed { .. } => job.available_at,
        };

        let mut sql = String::from(
            "UPDATE jobs SET status = ?, attempts = ?, last_error = ?, available_at = ?, \
             locked_by = NULL, lease_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'active' AND locked_by = ?",
        );
        if lease_fence.is_some() {
            sql.push_str(" AND lease_expires_at = ?");
        }

        let mut query = sqlx::query(&sql)
            .bind(decision.status().as_str())
            .bind(attempts as i64)
            .bind(error)
            .bind(available_at.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(job.id.to_string())
            .bind(holder);
        if let Some(fence) = lease_fence {
            query = query.bind(fence.timestamp_millis());
        }

        let result = query.execute(&self.pool).await.map_err(store_err)?;
        Ok((result.rows_affected() > 0).then_some(decision))
    }

    async fn fail_owned(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailDecision, QueueError> {
        let job = self.fetch(id).await?.ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Active {
            return Err(QueueError::InvalidTransition {
                id,
                from: job.status,
            });
        }
        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost(id));
        }

        match self
            .apply_failure(&job, worker_id, None, error, retryable)
            .await?
        {
            Some(decision) => Ok(decision),
            None => Err(self.rejection(id, worker_id).await),
        }
    }
}

fn store_err(e: sqlx::Error) -> QueueError {
    QueueError::StoreUnavailable(e.to_string())
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> QueueError {
    QueueError::StoreUnavailable(format!("corrupt job row ({column}): {detail}"))
}

fn millis(ms: i64, column: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt(column, ms))
}

fn row_to_entry(row: &SqliteRow) -> Result<JobEntry, QueueError> {
    let get_str = |column: &str| -> Result<String, QueueError> {
        row.try_get::<String, _>(column).map_err(|e| corrupt(column, e))
    };
    let get_i64 = |column: &str| -> Result<i64, QueueError> {
        row.try_get::<i64, _>(column).map_err(|e| corrupt(column, e))
    };
    let get_opt_str = |column: &str| -> Result<Option<String>, QueueError> {
        row.try_get::<Option<String>, _>(column)
            .map_err(|e| corrupt(column, e))
    };

    let id = get_str("id")?;
    let payload = get_str("payload")?;
    let lease_expires_at: Option<i64> = row
        .try_get("lease_expires_at")
        .map_err(|e| corrupt("lease_expires_at", e))?;

    Ok(JobEntry {
        id: Uuid::parse_str(&id).map_err(|e| corrupt("id", e))?,
        queue: get_str("queue")?,
        job_type: get_str("job_type")?.parse()?,
        payload: serde_json::from_str::<Value>(&payload)?,
        status: get_str("status")?.parse()?,
        attempts: get_i64("attempts")? as u32,
        max_attempts: get_i64("max_attempts")? as u32,
        available_at: millis(get_i64("available_at")?, "available_at")?,
        created_at: millis(get_i64("created_at")?, "created_at")?,
        updated_at: millis(get_i64("updated_at")?, "updated_at")?,
        last_error: get_opt_str("last_error")?,
        locked_by: get_opt_str("locked_by")?,
        lease_expires_at: lease_expires_at
            .map(|ms| millis(ms, "lease_expires_at"))
            .transpose()?,
        dedup_key: get_opt_str("dedup_key")?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        job_type: JobType,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        validate_enqueue(queue, &options)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let delay = options.delay.unwrap_or(Duration::ZERO);
        let available_at = deadline_after(now, delay);
        let status = if delay.is_zero() {
            JobStatus::Pending
        } else {
            JobStatus::Delayed
        };
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.policies.for_type(job_type).max_attempts);

        // Insert only while no live job shares the dedup key
        let sql = format!(
            "INSERT INTO jobs (id, queue, job_type, payload, status, attempts, max_attempts, \
             available_at, created_at, updated_at, dedup_key) \
             SELECT ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ? \
             WHERE ? IS NULL OR NOT EXISTS ( \
                 SELECT 1 FROM jobs WHERE queue = ? AND dedup_key = ? AND status IN {LIVE})"
        );
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(queue)
            .bind(job_type.as_str())
            .bind(serde_json::to_string(&payload)?)
            .bind(status.as_str())
            .bind(max_attempts as i64)
            .bind(available_at.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(options.dedup_key.as_deref())
            .bind(options.dedup_key.as_deref())
            .bind(queue)
            .bind(options.dedup_key.as_deref())
            .execute(&self.pool)
            .await;

        let inserted = match result {
            Ok(done) => done.rows_affected() > 0,
            // Lost a race against another writer on the live-dedup index
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => false,
            Err(e) => return Err(store_err(e)),
        };

        if inserted {
            return Ok(id);
        }

        let dedup_key = options.dedup_key.unwrap_or_default();
        let existing: Option<String> = sqlx::query_scalar(&format!(
            "SELECT id FROM jobs WHERE queue = ? AND dedup_key = ? AND status IN {LIVE} LIMIT 1"
        ))
        .bind(queue)
        .bind(&dedup_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let existing = existing
            .and_then(|s| Uuid::parse_str(&s).ok())
            .unwrap_or_else(Uuid::nil);
        Err(QueueError::Duplicate {
            dedup_key,
            existing,
        })
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        job_types: &[JobType],
        lease: Duration,
    ) -> Result<Option<JobEntry>, QueueError> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let placeholders = vec!["?"; job_types.len()].join(", ");
        let sql = format!(
            "UPDATE jobs SET status = 'active', locked_by = ?, lease_expires_at = ?, updated_at = ? \
             WHERE seq = ( \
                 SELECT seq FROM jobs \
                 WHERE queue = ? AND status IN {CLAIMABLE} AND available_at <= ? \
                   AND job_type IN ({placeholders}) \
                 ORDER BY available_at, seq \
                 LIMIT 1) \
             RETURNING *"
        );

        let mut query = sqlx::query(&sql)
            .bind(worker_id)
            .bind(deadline_after(now, lease).timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(queue)
            .bind(now.timestamp_millis());
        for job_type in job_types {
            query = query.bind(job_type.as_str());
        }

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'active' AND locked_by = ?",
        )
        .bind(deadline_after(now, lease).timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.fetch(id).await? {
            Some(_) => Ok(false),
            None => Err(QueueError::NotFound(id)),
        }
    }

    async fn mark_completed(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', last_error = NULL, locked_by = NULL, \
             lease_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'active' AND locked_by = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.rejection(id, worker_id).await {
            QueueError::InvalidTransition {
                from: JobStatus::Completed,
                ..
            } => Ok(()),
            e => Err(e),
        }
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<FailDecision, QueueError> {
        self.fail_owned(id, worker_id, error, true).await
    }

    async fn mark_dead(&self, id: JobId, worker_id: &str, error: &str) -> Result<(), QueueError> {
        self.fail_owned(id, worker_id, error, false).await?;
        Ok(())
    }

    async fn expire_leases(&self, queue: &str) -> Result<Vec<(JobEntry, FailDecision)>, QueueError> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE queue = ? AND status = 'active' AND lease_expires_at < ?",
        )
        .bind(queue)
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = row_to_entry(row)?;
            let holder = job.locked_by.clone().unwrap_or_default();
            let error = format!("lease held by {holder} expired without heartbeat");

            // Skipped when a heartbeat renewed the lease in the meantime
            if let Some(decision) = self
                .apply_failure(&job, &holder, job.lease_expires_at, &error, true)
                .await?
            {
                if let Some(updated) = self.fetch(job.id).await? {
                    out.push((updated, decision));
                }
            }
        }
        Ok(out)
    }

    async fn get(&self, id: JobId) -> Result<JobEntry, QueueError> {
        self.fetch(id).await?.ok_or(QueueError::NotFound(id))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs WHERE queue = ? GROUP BY status")
                .bind(queue)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.record(status.parse()?, count as u64);
        }
        Ok(stats)
    }

    async fn purge_finished(&self, queue: &str, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE queue = ? AND status IN ('completed', 'failed') AND updated_at < ?",
        )
        .bind(queue)
        .bind(before.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}
