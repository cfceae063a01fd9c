//! Named queue over a shared job store

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::backend::{JobStore, QueueError};
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::job::{EnqueueOptions, JobEntry, JobId, JobStatus, JobType, QueueStats};

/// Producer-facing handle to one queue partition.
///
/// Cheap to clone; every clone shares the store, the event bus and the
/// wakeup signal used to rouse idle workers.
#[derive(Clone)]
pub struct Queue {
    name: Arc<str>,
    store: Arc<dyn JobStore>,
    events: EventBus,
    wakeup: Arc<Notify>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

impl Queue {
    pub fn new(name: &str, store: Arc<dyn JobStore>, events: EventBus) -> Self {
        Self {
            name: Arc::from(name),
            store,
            events,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn wakeup(&self) -> &Arc<Notify> {
        &self.wakeup
    }

    /// Serialize `payload` and persist a new job.
    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        job_type: JobType,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::Validation(format!("payload is not serializable: {e}")))?;
        self.enqueue_value(job_type, payload, options).await
    }

    /// Enqueue an already-encoded payload.
    pub async fn enqueue_value(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let delayed = options.delay.map(|d| !d.is_zero()).unwrap_or(false);
        let id = self
            .store
            .enqueue(&self.name, job_type, payload, options)
            .await?;

        let status = if delayed {
            JobStatus::Delayed
        } else {
            JobStatus::Pending
        };
        debug!(job_id = %id, %job_type, queue = %self.name, %status, "Job enqueued");
        self.events
            .publish(JobEvent::new(JobEventKind::Enqueued, id, job_type, status));

        if !delayed {
            self.wakeup.notify_one();
        }
        Ok(id)
    }

    /// Enqueue a job that becomes claimable after `delay`.
    pub async fn enqueue_delayed<P: Serialize + ?Sized>(
        &self,
        job_type: JobType,
        payload: &P,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        self.enqueue(job_type, payload, EnqueueOptions::delayed(delay))
            .await
    }

    pub async fn get(&self, id: JobId) -> Result<JobEntry, QueueError> {
        self.store.get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats(&self.name).await
    }

    /// Jobs waiting to run (pending + delayed + retry-scheduled).
    pub async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.stats().await?.depth())
    }
}
