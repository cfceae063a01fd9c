//! Built-in retention cleanup job

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use meetq_queue::{
    Job, JobResult, JobStore, JobType, QueueConfig, QueueError, ScheduleEntry, WorkerPool,
};

/// Payload of a `cleanup-old-files` job. Falls back to the configured
/// retention window when `retention_days` is absent.
#[derive(Debug, Default, Deserialize)]
struct CleanupPayload {
    retention_days: Option<u32>,
}

/// Deletes finished job records older than the retention window.
pub struct CleanupOldFilesJob {
    store: Arc<dyn JobStore>,
    queue: String,
    retention_days: u32,
}

impl std::fmt::Debug for CleanupOldFilesJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupOldFilesJob")
            .field("queue", &self.queue)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl CleanupOldFilesJob {
    pub fn new(store: Arc<dyn JobStore>, queue: &str, retention_days: u32) -> Self {
        Self {
            store,
            queue: queue.to_string(),
            retention_days,
        }
    }
}

#[async_trait::async_trait]
impl Job for CleanupOldFilesJob {
    async fn execute(&mut self) -> JobResult {
        let Some(cutoff) = chrono::Duration::try_days(i64::from(self.retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return JobResult::Fatal(format!(
                "retention of {} days reaches past the earliest representable time",
                self.retention_days
            ));
        };
        match self.store.purge_finished(&self.queue, cutoff).await {
            Ok(purged) => {
                info!(
                    queue = %self.queue,
                    purged,
                    retention_days = self.retention_days,
                    "Purged finished jobs past retention"
                );
                JobResult::Success
            }
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}

/// Register the cleanup handler on `pool`.
pub fn register(pool: &mut WorkerPool, store: Arc<dyn JobStore>, config: &QueueConfig) {
    let queue = config.queue_name.clone();
    let default_days = config.retention_days;
    pool.register_job_factory(JobType::CleanupOldFiles, move |entry| {
        let payload: CleanupPayload = if entry.payload.is_null() {
            CleanupPayload::default()
        } else {
            serde_json::from_value(entry.payload.clone())?
        };
        Ok(Box::new(CleanupOldFilesJob::new(
            store.clone(),
            &queue,
            payload.retention_days.unwrap_or(default_days),
        )) as Box<dyn Job>)
    });
}

/// Nightly schedule entry for the cleanup job.
pub fn schedule(config: &QueueConfig) -> Result<ScheduleEntry, QueueError> {
    let retention_days = config.retention_days;
    Ok(
        ScheduleEntry::new("cleanup-old-files", &config.cleanup_cron, JobType::CleanupOldFiles)?
            .with_payload(move || serde_json::json!({ "retention_days": retention_days })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use meetq_queue::{EnqueueOptions, JobStatus, MemoryJobStore};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cleanup_purges_only_expired_finished_jobs() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let lease = Duration::from_secs(30);

        let done = store
            .enqueue("meeting-jobs", JobType::GenerateSummary, json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let waiting = store
            .enqueue("meeting-jobs", JobType::GenerateSummary, json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        store
            .claim_next("meeting-jobs", "w", &[JobType::GenerateSummary], lease)
            .await
            .unwrap();
        store.mark_completed(done, "w").await.unwrap();

        // A 30-day window keeps the job completed a moment ago
        let mut job = CleanupOldFilesJob::new(store.clone(), "meeting-jobs", 30);
        assert!(matches!(job.execute().await, JobResult::Success));
        assert_eq!(store.get(done).await.unwrap().status, JobStatus::Completed);

        let mut job = CleanupOldFilesJob::new(store.clone(), "meeting-jobs", 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(job.execute().await, JobResult::Success));
        assert!(store.get(done).await.is_err());
        assert_eq!(store.get(waiting).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_unrepresentable_retention_fails_without_retry() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let mut job = CleanupOldFilesJob::new(store, "meeting-jobs", u32::MAX);
        match job.execute().await {
            JobResult::Fatal(reason) => assert!(reason.contains(&u32::MAX.to_string())),
            other => panic!("expected a fatal result, got {other:?}"),
        }
    }

    #[test]
    fn test_schedule_uses_configured_cron() {
        let config = QueueConfig::default();
        let entry = schedule(&config).unwrap();
        assert_eq!(entry.expression(), "0 2 * * *");
        assert_eq!(entry.job_type(), JobType::CleanupOldFiles);
        assert_eq!(entry.dedup_key(), "schedule:cleanup-old-files");

        let bad = QueueConfig {
            cleanup_cron: "nightly".into(),
            ..QueueConfig::default()
        };
        assert!(matches!(schedule(&bad), Err(QueueError::Configuration(_))));
    }
}
