//! Worker Pool for processing jobs

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{JobStore, QueueError};
use crate::events::{JobEvent, JobEventKind};
use crate::job::{FailDecision, Job, JobEntry, JobResult, JobStatus, JobType};
use crate::queue::Queue;

/// Longest pause between claim attempts while the store is unreachable.
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(30);

/// Floor for the idle poll and the first store backoff step.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of handlers running at once
    pub concurrency: usize,
    /// Re-poll interval while the queue is empty
    pub poll_interval: Duration,
    /// Claim lease; renewed every third of its length while a handler runs
    pub lease: Duration,
    /// Handler runs longer than this fail with a timeout
    pub handler_timeout: Duration,
    /// Time in-flight handlers get to finish after shutdown is requested
    pub shutdown_grace: Duration,
    /// Job types this process must be able to run; checked at start
    pub required_types: Vec<JobType>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            required_types: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_required_types(mut self, types: impl IntoIterator<Item = JobType>) -> Self {
        self.required_types = types.into_iter().collect();
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.lease / 3).max(MIN_POLL_INTERVAL)
    }

    fn idle_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    /// Half a lease, never below the poll interval and never above a minute
    fn reap_interval(&self) -> Duration {
        (self.lease / 2)
            .max(self.idle_interval())
            .min(MAX_REAP_INTERVAL)
    }
}

type JobFactory =
    Box<dyn Fn(&JobEntry) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync>;

#[derive(Default)]
struct JobRegistry {
    factories: HashMap<JobType, JobFactory>,
}

impl JobRegistry {
    fn job_types(&self) -> Vec<JobType> {
        self.factories.keys().copied().collect()
    }

    fn build(&self, entry: &JobEntry) -> Option<Result<Box<dyn Job>, serde_json::Error>> {
        self.factories.get(&entry.job_type).map(|f| f(entry))
    }
}

/// Fixed-size pool of execution slots over one queue.
pub struct WorkerPool {
    queue: Queue,
    config: WorkerConfig,
    registry: JobRegistry,
}

impl WorkerPool {
    pub fn new(queue: Queue, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            registry: JobRegistry::default(),
        }
    }

    /// Register a job type whose payload decodes straight into `J`
    pub fn register_job_type<J: Job + DeserializeOwned + 'static>(
        &mut self,
        job_type: JobType,
    ) -> &mut Self {
        self.register_job_factory(job_type, |entry: &JobEntry| {
            let job: J = serde_json::from_value(entry.payload.clone())?;
            Ok(Box::new(job) as Box<dyn Job>)
        })
    }

    /// Register a custom factory (useful for jobs with dependency injection)
    pub fn register_job_factory<F>(&mut self, job_type: JobType, factory: F) -> &mut Self
    where
        F: Fn(&JobEntry) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync + 'static,
    {
        self.registry.factories.insert(job_type, Box::new(factory));
        debug!(%job_type, "Registered job handler");
        self
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.registry.job_types()
    }

    /// Start claiming. Fails if a required job type has no handler.
    pub fn start(self) -> Result<WorkerHandle, QueueError> {
        let missing: Vec<String> = self
            .config
            .required_types
            .iter()
            .filter(|t| !self.registry.factories.contains_key(t))
            .map(|t| t.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(QueueError::Configuration(format!(
                "no handler registered for required job types: {}",
                missing.join(", ")
            )));
        }

        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher {
            pool_id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            queue: self.queue,
            config: Arc::new(self.config),
            registry: Arc::new(self.registry),
            semaphore: semaphore.clone(),
            claims: AtomicU64::new(0),
        };

        info!(
            queue = %dispatcher.queue.name(),
            concurrency,
            job_types = ?dispatcher.registry.job_types(),
            "Worker pool started"
        );

        let grace = dispatcher.config.shutdown_grace;
        let task = tokio::spawn(dispatcher.run(shutdown_rx));

        Ok(WorkerHandle {
            shutdown_tx,
            dispatcher: task,
            semaphore,
            concurrency,
            grace,
        })
    }
}

/// Handle for a running pool.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    grace: Duration,
}

impl WorkerHandle {
    /// Slots currently claiming or running a job.
    pub fn active_workers(&self) -> usize {
        self.concurrency - self.semaphore.available_permits()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Stop claiming immediately, then wait up to the grace period for
    /// in-flight handlers. Returns how many were still running when the grace
    /// period ran out; their jobs stay `active` until the lease expires.
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.dispatcher.await {
            error!(error = ?e, "Worker dispatcher panicked");
        }

        let all = self.concurrency as u32;
        match tokio::time::timeout(self.grace, self.semaphore.acquire_many(all)).await {
            Ok(_) => {
                info!("Worker pool drained");
                0
            }
            Err(_) => {
                let abandoned = self.concurrency - self.semaphore.available_permits();
                warn!(
                    abandoned,
                    grace_secs = self.grace.as_secs(),
                    "Shutdown grace period elapsed with jobs still running"
                );
                abandoned
            }
        }
    }
}

struct Dispatcher {
    pool_id: String,
    queue: Queue,
    config: Arc<WorkerConfig>,
    registry: Arc<JobRegistry>,
    semaphore: Arc<Semaphore>,
    claims: AtomicU64,
}

impl Dispatcher {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll = self.config.idle_interval();
        let reap_every = self.config.reap_interval();
        let job_types = self.registry.job_types();
        let mut store_backoff = poll;
        let mut last_reap: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reap.map(|t| t.elapsed() >= reap_every).unwrap_or(true) {
                self.reap_expired_leases().await;
                last_reap = Some(Instant::now());
            }

            // Take a slot before claiming so a claimed job never waits for one
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker_id = format!(
                "{}-{}",
                self.pool_id,
                self.claims.fetch_add(1, Ordering::Relaxed)
            );

            let idle = match self
                .queue
                .store()
                .claim_next(self.queue.name(), &worker_id, &job_types, self.config.lease)
                .await
            {
                Ok(Some(entry)) => {
                    store_backoff = poll;
                    self.spawn_execution(entry, worker_id, permit);
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    poll
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, retry_in_ms = store_backoff.as_millis() as u64, "Failed to claim job");
                    let wait = store_backoff;
                    store_backoff = (store_backoff * 2).min(MAX_STORE_BACKOFF);
                    wait
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.queue.wakeup().notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!(queue = %self.queue.name(), "Worker pool stopped claiming");
    }

    fn spawn_execution(&self, entry: JobEntry, worker_id: String, permit: OwnedSemaphorePermit) {
        let execution = Execution {
            queue: self.queue.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            worker_id,
        };
        tokio::spawn(async move {
            execution.run(entry).await;
            drop(permit);
        });
    }

    async fn reap_expired_leases(&self) {
        match self.queue.store().expire_leases(self.queue.name()).await {
            Ok(expired) => {
                for (job, decision) in expired {
                    warn!(job_id = %job.id, job_type = %job.job_type, "Reclaimed job with expired lease");
                    publish_failure(&self.queue, &job, decision, job.last_error.clone().unwrap_or_default());
                }
            }
            Err(e) => warn!(error = %e, "Failed to expire stale leases"),
        }
    }
}

/// Everything a spawned task needs to run one claimed job.
struct Execution {
    queue: Queue,
    config: Arc<WorkerConfig>,
    registry: Arc<JobRegistry>,
    worker_id: String,
}

impl Execution {
    async fn run(self, entry: JobEntry) {
        let start = Instant::now();
        let attempt = entry.attempts + 1;

        info!(job_id = %entry.id, job_type = %entry.job_type, attempt, "Processing job");
        self.queue.events().publish(
            JobEvent::new(JobEventKind::Started, entry.id, entry.job_type, JobStatus::Active)
                .with_attempts(entry.attempts),
        );

        let result = match self.registry.build(&entry) {
            Some(Ok(job)) => self.execute(&entry, job).await,
            Some(Err(e)) => {
                error!(job_id = %entry.id, error = %e, "Job payload deserialization failed");
                JobResult::Fatal(format!("payload rejected by handler: {e}"))
            }
            None => JobResult::Retry(format!("no handler registered for {}", entry.job_type)),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let store = self.queue.store();

        match result {
            JobResult::Success => match store.mark_completed(entry.id, &self.worker_id).await {
                Ok(()) => {
                    info!(job_id = %entry.id, job_type = %entry.job_type, duration_ms = elapsed_ms, "Job completed");
                    self.queue.events().publish(
                        JobEvent::new(
                            JobEventKind::Completed,
                            entry.id,
                            entry.job_type,
                            JobStatus::Completed,
                        )
                        .with_attempts(attempt),
                    );
                }
                Err(e) => error!(job_id = %entry.id, error = %e, "Failed to mark job as completed"),
            },
            JobResult::Retry(reason) => {
                match store.mark_failed(entry.id, &self.worker_id, &reason).await {
                    Ok(decision) => {
                        warn!(
                            job_id = %entry.id,
                            job_type = %entry.job_type,
                            attempt,
                            error = %reason,
                            duration_ms = elapsed_ms,
                            next = %decision.status(),
                            "Job failed"
                        );
                        publish_failure(&self.queue, &entry, decision, reason);
                    }
                    Err(e) => error!(job_id = %entry.id, error = %e, "Failed to mark job as failed"),
                }
            }
            JobResult::Fatal(reason) => {
                match store.mark_dead(entry.id, &self.worker_id, &reason).await {
                    Ok(()) => {
                        error!(job_id = %entry.id, job_type = %entry.job_type, error = %reason, "Job failed permanently");
                        publish_failure(
                            &self.queue,
                            &entry,
                            FailDecision::Failed { attempts: attempt },
                            reason,
                        );
                    }
                    Err(e) => error!(job_id = %entry.id, error = %e, "Failed to mark job as dead"),
                }
            }
        }
    }

    /// Run the handler under the timeout, renewing the lease as it goes.
    async fn execute(&self, entry: &JobEntry, mut job: Box<dyn Job>) -> JobResult {
        let timeout = self.config.handler_timeout;
        let mut task = tokio::spawn(async move { job.execute().await });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => JobResult::Retry("handler panicked".to_string()),
                        Err(e) => JobResult::Retry(format!("handler task failed: {e}")),
                    };
                }
                _ = &mut deadline => {
                    task.abort();
                    warn!(job_id = %entry.id, timeout_secs = timeout.as_secs_f64(), "Job exceeded handler timeout");
                    return JobResult::Retry(QueueError::Timeout(timeout).to_string());
                }
                _ = heartbeat.tick() => {
                    match self
                        .queue
                        .store()
                        .heartbeat(entry.id, &self.worker_id, self.config.lease)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => warn!(job_id = %entry.id, "Lease lost while job was running"),
                        Err(e) => warn!(job_id = %entry.id, error = %e, "Lease heartbeat failed"),
                    }
                }
            }
        }
    }
}

fn publish_failure(queue: &Queue, job: &JobEntry, decision: FailDecision, error: String) {
    let kind = match decision {
        FailDecision::Retry { .. } => JobEventKind::Retried,
        FailDecision::Failed { .. } => JobEventKind::Failed,
    };
    queue.events().publish(
        JobEvent::new(kind, job.id, job.job_type, decision.status())
            .with_attempts(decision.attempts())
            .with_error(error),
    );
}
