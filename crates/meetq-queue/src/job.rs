//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::QueueError;

/// Job Identifier
pub type JobId = Uuid;

/// Kind of background work. Selects the handler that runs a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Post-process a finished meeting recording
    ProcessRecording,
    /// Speech-to-text over a recording's audio track
    TranscribeAudio,
    /// Summarize a transcript
    GenerateSummary,
    /// Nightly retention cleanup
    CleanupOldFiles,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::ProcessRecording,
        JobType::TranscribeAudio,
        JobType::GenerateSummary,
        JobType::CleanupOldFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessRecording => "process-recording",
            Self::TranscribeAudio => "transcribe-audio",
            Self::GenerateSummary => "generate-summary",
            Self::CleanupOldFiles => "cleanup-old-files",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| QueueError::Validation(format!("unknown job type: {s}")))
    }
}

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Waiting in queue
    Pending,
    /// Enqueued with a delay, not yet due
    Delayed,
    /// Claimed by a worker
    Active,
    /// Handler succeeded
    Completed,
    /// Permanently failed
    Failed,
    /// Failed, waiting for its backoff to elapse
    RetryScheduled,
}

impl JobStatus {
    /// Statuses a worker may claim from (once `available_at` has passed).
    pub const CLAIMABLE: [JobStatus; 3] = [
        JobStatus::Pending,
        JobStatus::Delayed,
        JobStatus::RetryScheduled,
    ];

    /// Statuses that count as "still in flight" for scheduler deduplication.
    pub const LIVE: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Delayed,
        JobStatus::Active,
        JobStatus::RetryScheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry-scheduled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry-scheduled" => Ok(Self::RetryScheduled),
            other => Err(QueueError::Validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Typed job executed by a worker.
///
/// Implementors are decoded from the stored payload right before execution,
/// so a payload the job cannot decode never reaches `execute`.
#[async_trait::async_trait]
pub trait Job: Send + Sync + Debug {
    /// Execute the job
    async fn execute(&mut self) -> JobResult;
}

/// Result of job execution
#[derive(Debug)]
pub enum JobResult {
    /// Job succeeded
    Success,
    /// Job failed but should retry
    Retry(String),
    /// Job failed permanently
    Fatal(String),
}

/// Per-enqueue options
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hold the job back for this long before it can be claimed
    pub delay: Option<Duration>,
    /// Overrides the retry policy's attempt ceiling for this job
    pub max_attempts: Option<u32>,
    /// Rejects the enqueue while a live job with the same key exists
    pub dedup_key: Option<String>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// A persisted job entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub queue: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub dedup_key: Option<String>,
}

/// `at + d`, saturating at the largest representable instant.
pub fn deadline_after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What the store did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDecision {
    /// Job goes back to the queue once `available_at` passes
    Retry {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    /// Attempts exhausted (or failure was fatal); job is terminal
    Failed { attempts: u32 },
}

impl FailDecision {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Retry { .. } => JobStatus::RetryScheduled,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Retry { attempts, .. } | Self::Failed { attempts } => *attempts,
        }
    }
}

/// Job counts per status for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub delayed: u64,
    pub active: u64,
    pub retry_scheduled: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Jobs waiting to run: pending + delayed + retry-scheduled.
    pub fn depth(&self) -> u64 {
        self.pending + self.delayed + self.retry_scheduled
    }

    pub fn record(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Delayed => self.delayed += n,
            JobStatus::Active => self.active += n,
            JobStatus::RetryScheduled => self.retry_scheduled += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_round_trips_through_str() {
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
        assert_eq!(
            serde_json::to_value(JobType::CleanupOldFiles).unwrap(),
            serde_json::json!("cleanup-old-files")
        );
    }

    #[test]
    fn test_unknown_job_type_is_validation_error() {
        let err = "send-invoice".parse::<JobType>().unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn test_status_classes() {
        assert!(JobStatus::Delayed.is_claimable());
        assert!(!JobStatus::Active.is_claimable());
        assert!(JobStatus::Active.is_live());
        assert!(!JobStatus::Completed.is_live());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::RetryScheduled.is_terminal());
        assert_eq!(
            "retry-scheduled".parse::<JobStatus>().unwrap(),
            JobStatus::RetryScheduled
        );
    }

    #[test]
    fn test_queue_depth() {
        let mut stats = QueueStats::default();
        stats.record(JobStatus::Pending, 2);
        stats.record(JobStatus::Delayed, 1);
        stats.record(JobStatus::RetryScheduled, 1);
        stats.record(JobStatus::Active, 5);
        stats.record(JobStatus::Completed, 9);
        assert_eq!(stats.depth(), 4);
    }
}
