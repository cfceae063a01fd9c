//! In-memory job store with a per-queue claim index

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{validate_enqueue, JobStore, QueueError};
use crate::backoff::RetryPolicies;
use crate::job::{
    deadline_after, EnqueueOptions, FailDecision, JobEntry, JobId, JobStatus, JobType, QueueStats,
};

/// Claim index key: earliest `available_at` first, then insertion order.
type IndexKey = (DateTime<Utc>, u64, Uuid);

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, JobEntry>,
    /// Claimable jobs per queue
    ready: HashMap<String, BTreeSet<IndexKey>>,
    index_keys: HashMap<Uuid, IndexKey>,
    /// Live dedup keys per queue
    dedup: HashMap<(String, String), Uuid>,
    next_seq: u64,
}

impl Inner {
    fn push_ready(&mut self, id: Uuid, queue: &str, available_at: DateTime<Utc>) {
        let key = (available_at, self.next_seq, id);
        self.next_seq += 1;
        self.ready.entry(queue.to_string()).or_default().insert(key);
        self.index_keys.insert(id, key);
    }

    fn pop_ready(&mut self, id: Uuid, queue: &str) {
        if let Some(key) = self.index_keys.remove(&id) {
            if let Some(set) = self.ready.get_mut(queue) {
                set.remove(&key);
            }
        }
    }

    fn release_dedup(&mut self, job: &JobEntry) {
        if let Some(key) = &job.dedup_key {
            let slot = (job.queue.clone(), key.clone());
            if self.dedup.get(&slot) == Some(&job.id) {
                self.dedup.remove(&slot);
            }
        }
    }

    /// The job, provided it is active and claimed by `worker_id`.
    fn owned_active(&mut self, id: Uuid, worker_id: &str) -> Result<&mut JobEntry, QueueError> {
        let job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Active {
            return Err(QueueError::InvalidTransition {
                id,
                from: job.status,
            });
        }
        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost(id));
        }
        Ok(job)
    }

    fn apply_failure(
        &mut self,
        id: Uuid,
        error: &str,
        retryable: bool,
        policies: &RetryPolicies,
    ) -> Result<FailDecision, QueueError> {
        let now = Utc::now();
        let job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let policy = policies.for_type(job.job_type);

        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.lease_expires_at = None;
        job.updated_at = now;

        if retryable && policy.should_retry(job.attempts, job.max_attempts) {
            let delay = policy.next_delay(job.attempts);
            let available_at = deadline_after(now, delay);
            job.status = JobStatus::RetryScheduled;
            job.available_at = available_at;

            tracing::debug!(
                job_id = %id,
                attempts = job.attempts,
                delay_ms = delay.as_millis() as u64,
                "Re-queuing job with backoff"
            );

            let (attempts, queue) = (job.attempts, job.queue.clone());
            self.push_ready(id, &queue, available_at);
            Ok(FailDecision::Retry {
                attempts,
                available_at,
            })
        } else {
            job.status = JobStatus::Failed;
            let attempts = job.attempts;
            let job = job.clone();
            self.release_dedup(&job);
            Ok(FailDecision::Failed { attempts })
        }
    }
}

/// Job store kept entirely in process memory.
///
/// Same semantics as the durable stores, minus durability: useful for tests
/// and for embedding the queue in a single process.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
    policies: RetryPolicies,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: RetryPolicies) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            policies,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        job_type: JobType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        validate_enqueue(queue, &options)?;

        let mut inner = self.inner.write().await;

        if let Some(key) = &options.dedup_key {
            let slot = (queue.to_string(), key.clone());
            if let Some(existing) = inner.dedup.get(&slot).copied() {
                let live = inner
                    .jobs
                    .get(&existing)
                    .map(|j| j.status.is_live())
                    .unwrap_or(false);
                if live {
                    return Err(QueueError::Duplicate {
                        dedup_key: key.clone(),
                        existing,
                    });
                }
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let delay = options.delay.unwrap_or(Duration::ZERO);
        let available_at = deadline_after(now, delay);
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.policies.for_type(job_type).max_attempts);

        let entry = JobEntry {
            id,
            queue: queue.to_string(),
            job_type,
            payload,
            status: if delay.is_zero() {
                JobStatus::Pending
            } else {
                JobStatus::Delayed
            },
            attempts: 0,
            max_attempts,
            available_at,
            created_at: now,
            updated_at: now,
            last_error: None,
            locked_by: None,
            lease_expires_at: None,
            dedup_key: options.dedup_key.clone(),
        };

        if let Some(key) = options.dedup_key {
            inner.dedup.insert((queue.to_string(), key), id);
        }
        inner.jobs.insert(id, entry);
        inner.push_ready(id, queue, available_at);

        Ok(id)
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

        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let found = inner.ready.get(queue).and_then(|set| {
            set.iter()
                .take_while(|(available_at, _, _)| *available_at <= now)
                .map(|(_, _, id)| *id)
                .find(|id| {
                    inner
                        .jobs
                        .get(id)
                        .map(|j| job_types.contains(&j.job_type) && j.status.is_claimable())
                        .unwrap_or(false)
                })
        });

        let Some(id) = found else {
            return Ok(None);
        };

        inner.pop_ready(id, queue);
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = JobStatus::Active;
        job.locked_by = Some(worker_id.to_string());
        job.lease_expires_at = Some(deadline_after(now, lease));
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Active || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        let now = Utc::now();
        job.lease_expires_at = Some(deadline_after(now, lease));
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_completed(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.get(&id).map(|j| j.status) == Some(JobStatus::Completed) {
            return Ok(());
        }

        let job = inner.owned_active(id, worker_id)?;
        job.status = JobStatus::Completed;
        job.last_error = None;
        job.locked_by = None;
        job.lease_expires_at = None;
        job.updated_at = Utc::now();

        let job = job.clone();
        inner.release_dedup(&job);
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<FailDecision, QueueError> {
        let mut inner = self.inner.write().await;
        inner.owned_active(id, worker_id)?;
        inner.apply_failure(id, error, true, &self.policies)
    }

    async fn mark_dead(&self, id: JobId, worker_id: &str, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        inner.owned_active(id, worker_id)?;
        inner.apply_failure(id, error, false, &self.policies)?;
        Ok(())
    }

    async fn expire_leases(&self, queue: &str) -> Result<Vec<(JobEntry, FailDecision)>, QueueError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.status == JobStatus::Active
                    && j.lease_expires_at.map(|t| t < now).unwrap_or(false)
            })
            .map(|j| j.id)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            let holder = inner
                .jobs
                .get(&id)
                .and_then(|j| j.locked_by.clone())
                .unwrap_or_default();
            let error = format!("lease held by {holder} expired without heartbeat");
            let decision = inner.apply_failure(id, &error, true, &self.policies)?;
            if let Some(job) = inner.jobs.get(&id) {
                out.push((job.clone(), decision));
            }
        }
        Ok(out)
    }

    async fn get(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let inner = self.inner.read().await;
        inner.jobs.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let inner = self.inner.read().await;
        let mut stats = QueueStats::default();
        for job in inner.jobs.values().filter(|j| j.queue == queue) {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn purge_finished(&self, queue: &str, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut inner = self.inner.write().await;
        let before_len = inner.jobs.len();
        inner
            .jobs
            .retain(|_, j| !(j.queue == queue && j.status.is_terminal() && j.updated_at < before));
        Ok((before_len - inner.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);
    const ALL: &[JobType] = &JobType::ALL;

    #[tokio::test]
    async fn test_enqueue_claim() {
        let store = MemoryJobStore::new();
        let payload = json!({ "recording_id": "rec-1" });

        let id = store
            .enqueue("meeting-jobs", JobType::ProcessRecording, payload.clone(), Default::default())
            .await
            .unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);

        let job = store
            .claim_next("meeting-jobs", "w1", ALL, LEASE)
            .await
            .unwrap()
            .expect("Should have job");
        assert_eq!(job.id, id);
        assert_eq!(job.payload, payload);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.locked_by.as_deref(), Some("w1"));

        let empty = store.claim_next("meeting-jobs", "w2", ALL, LEASE).await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_scoped_to_queue() {
        let store = MemoryJobStore::new();
        let a = store
            .enqueue("q", JobType::GenerateSummary, json!(1), Default::default())
            .await
            .unwrap();
        let _other = store
            .enqueue("other", JobType::GenerateSummary, json!(2), Default::default())
            .await
            .unwrap();
        let b = store
            .enqueue("q", JobType::GenerateSummary, json!(3), Default::default())
            .await
            .unwrap();

        let first = store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        let second = store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(second.id, b);
        assert!(store.claim_next("q", "w", ALL, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_unregistered_types() {
        let store = MemoryJobStore::new();
        let transcribe = store
            .enqueue("q", JobType::TranscribeAudio, json!({}), Default::default())
            .await
            .unwrap();
        let cleanup = store
            .enqueue("q", JobType::CleanupOldFiles, json!({}), Default::default())
            .await
            .unwrap();

        let job = store
            .claim_next("q", "w", &[JobType::CleanupOldFiles], LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, cleanup);
        assert_eq!(store.get(transcribe).await.unwrap().status, JobStatus::Pending);
        assert!(store.claim_next("q", "w", &[], LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(
                "q",
                JobType::CleanupOldFiles,
                json!({}),
                EnqueueOptions::delayed(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Delayed);

        assert!(store.claim_next("q", "w", ALL, LEASE).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;

        let job = store
            .claim_next("q", "w", ALL, LEASE)
            .await
            .unwrap()
            .expect("Should have delayed job");
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let store = MemoryJobStore::new();
        let err = store
            .enqueue("", JobType::CleanupOldFiles, json!({}), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let err = store
            .enqueue(
                "q",
                JobType::CleanupOldFiles,
                json!({}),
                EnqueueOptions::default().with_max_attempts(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails() {
        let store = MemoryJobStore::with_policies(RetryPolicies::new(RetryPolicy::immediate(2)));
        let id = store
            .enqueue("q", JobType::TranscribeAudio, json!({}), Default::default())
            .await
            .unwrap();

        store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        let decision = store.mark_failed(id, "w", "asr timeout").await.unwrap();
        assert!(matches!(decision, FailDecision::Retry { attempts: 1, .. }));

        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::RetryScheduled);
        assert_eq!(job.last_error.as_deref(), Some("asr timeout"));
        assert!(job.locked_by.is_none());

        store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        let decision = store.mark_failed(id, "w", "asr timeout again").await.unwrap();
        assert_eq!(decision, FailDecision::Failed { attempts: 2 });

        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("asr timeout again"));
        assert!(store.claim_next("q", "w", ALL, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_dead_skips_retries() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue("q", JobType::GenerateSummary, json!({}), Default::default())
            .await
            .unwrap();
        store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        store.mark_dead(id, "w", "bad payload").await.unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_mark_completed_is_idempotent_and_fenced() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue("q", JobType::ProcessRecording, json!({}), Default::default())
            .await
            .unwrap();

        // Not claimed yet
        let err = store.mark_completed(id, "w").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        let err = store.mark_completed(id, "intruder").await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));

        store.mark_completed(id, "w").await.unwrap();
        store.mark_completed(id, "w").await.unwrap();
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_expired_lease_goes_through_retry_path() {
        let store = MemoryJobStore::with_policies(RetryPolicies::new(RetryPolicy::immediate(3)));
        let id = store
            .enqueue("q", JobType::TranscribeAudio, json!({}), Default::default())
            .await
            .unwrap();

        store
            .claim_next("q", "stale", ALL, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert!(store.expire_leases("q").await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;

        let expired = store.expire_leases("q").await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0.id, id);
        assert!(matches!(expired[0].1, FailDecision::Retry { attempts: 1, .. }));

        // The stale worker can no longer report on the job
        assert!(!store.heartbeat(id, "stale", LEASE).await.unwrap());
        let err = store.mark_completed(id, "stale").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        let job = store.claim_next("q", "fresh", ALL, LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_dedup_key_blocks_live_duplicates() {
        let store = MemoryJobStore::new();
        let opts = EnqueueOptions::default().with_dedup_key("nightly-cleanup");

        let first = store
            .enqueue("q", JobType::CleanupOldFiles, json!({}), opts.clone())
            .await
            .unwrap();
        let err = store
            .enqueue("q", JobType::CleanupOldFiles, json!({}), opts.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Duplicate { existing, .. } if existing == first));

        // A different queue is a different namespace
        store
            .enqueue("other", JobType::CleanupOldFiles, json!({}), opts.clone())
            .await
            .unwrap();

        store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        store.mark_completed(first, "w").await.unwrap();

        let second = store
            .enqueue("q", JobType::CleanupOldFiles, json!({}), opts)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_stats_and_purge() {
        let store = MemoryJobStore::new();
        let done = store
            .enqueue("q", JobType::CleanupOldFiles, json!({}), Default::default())
            .await
            .unwrap();
        store
            .enqueue("q", JobType::CleanupOldFiles, json!({}), Default::default())
            .await
            .unwrap();
        store
            .enqueue(
                "q",
                JobType::CleanupOldFiles,
                json!({}),
                EnqueueOptions::delayed(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        store.claim_next("q", "w", ALL, LEASE).await.unwrap().unwrap();
        store.mark_completed(done, "w").await.unwrap();

        let stats = store.stats("q").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.depth(), 2);

        let purged = store
            .purge_finished("q", Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(matches!(store.get(done).await, Err(QueueError::NotFound(_))));
        assert_eq!(store.stats("q").await.unwrap().depth(), 2);
    }
}
