//! Job store trait

use crate::job::{EnqueueOptions, FailDecision, JobEntry, JobId, JobType, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Duplicate job for dedup key {dedup_key} (existing {existing})")]
    Duplicate { dedup_key: String, existing: JobId },
    #[error("Handler error: {0}")]
    Handler(String),
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Lease on job {0} is held by another worker")]
    LeaseLost(JobId),
    #[error("Job {id} cannot move out of {from}")]
    InvalidTransition {
        id: JobId,
        from: crate::job::JobStatus,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Input checks shared by every store implementation.
pub fn validate_enqueue(queue: &str, options: &EnqueueOptions) -> Result<(), QueueError> {
    if queue.trim().is_empty() {
        return Err(QueueError::Validation("queue name must not be empty".into()));
    }
    if options.max_attempts == Some(0) {
        return Err(QueueError::Validation("max_attempts must be at least 1".into()));
    }
    if matches!(&options.dedup_key, Some(k) if k.is_empty()) {
        return Err(QueueError::Validation("dedup key must not be empty".into()));
    }
    Ok(())
}

/// Durable owner of job records.
///
/// Every state change goes through this trait; queues and workers only hold
/// ids and the copy returned by the latest call.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `pending` (or `delayed` when a delay is given)
    async fn enqueue(
        &self,
        queue: &str,
        job_type: JobType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>;

    /// Atomically claim the oldest due job of one of `job_types`
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        job_types: &[JobType],
        lease: Duration,
    ) -> Result<Option<JobEntry>, QueueError>;

    /// Extend the lease on a job still held by `worker_id`.
    /// Returns false when the claim has been lost.
    async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError>;

    /// `active -> completed`; a no-op on an already completed job
    async fn mark_completed(&self, id: JobId, worker_id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt and either schedule a retry or fail the job
    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<FailDecision, QueueError>;

    /// Record a non-retryable failure; the job goes straight to `failed`
    async fn mark_dead(&self, id: JobId, worker_id: &str, error: &str) -> Result<(), QueueError>;

    /// Push every active job whose lease ran out through the failure path
    async fn expire_leases(&self, queue: &str) -> Result<Vec<(JobEntry, FailDecision)>, QueueError>;

    /// Fetch a job by id
    async fn get(&self, id: JobId) -> Result<JobEntry, QueueError>;

    /// Job counts per status
    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Delete completed and failed jobs last touched before `before`
    async fn purge_finished(&self, queue: &str, before: DateTime<Utc>) -> Result<u64, QueueError>;
}
