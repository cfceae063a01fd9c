//! # meetq Queue
//!
//! Durable background job processing for the meeting-recording service.
//!
//! Features:
//! - `JobStore` trait with an in-memory implementation (SQLite lives in `meetq-persist`)
//! - Leased claims with heartbeats, so a crashed worker's job is retried
//! - Worker pool with concurrency control and handler timeouts
//! - Retry with exponential backoff and jitter, overridable per job type
//! - Lifecycle events over a broadcast bus
//! - Cron scheduler that never overlaps runs of the same entry

pub mod backend;
pub mod backoff;
pub mod config;
pub mod events;
pub mod job;
pub mod memory;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use backend::{JobStore, QueueError};
pub use backoff::{BackoffStrategy, RetryPolicies, RetryPolicy};
pub use config::{ConfigError, QueueConfig, MAX_RETENTION_DAYS};
pub use events::{EventBus, JobEvent, JobEventKind};
pub use job::{
    EnqueueOptions, FailDecision, Job, JobEntry, JobId, JobResult, JobStatus, JobType, QueueStats,
};
pub use memory::MemoryJobStore;
pub use queue::Queue;
pub use scheduler::{ScheduleEntry, Scheduler};
pub use worker::{WorkerConfig, WorkerHandle, WorkerPool};
