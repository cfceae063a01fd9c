//! Cron-driven enqueueing of recurring jobs
//!
//! Expressions are evaluated in UTC. Five-field crontab syntax is accepted and
//! treated as firing on second zero; six and seven field expressions (with
//! seconds, and optionally years) are passed through unchanged.
//!
//! A run is only enqueued when no live job carries the entry's dedup key, so a
//! slow run is never overlapped by the next one.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::backend::QueueError;
use crate::job::{EnqueueOptions, JobId, JobType};
use crate::queue::Queue;

pub type PayloadFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// One recurring job definition.
#[derive(Clone)]
pub struct ScheduleEntry {
    name: String,
    expression: String,
    schedule: cron::Schedule,
    job_type: JobType,
    payload: PayloadFn,
    dedup_key: String,
}

impl std::fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .field("job_type", &self.job_type)
            .field("dedup_key", &self.dedup_key)
            .finish()
    }
}

impl ScheduleEntry {
    pub fn new(name: &str, expression: &str, job_type: JobType) -> Result<Self, QueueError> {
        if name.trim().is_empty() {
            return Err(QueueError::Configuration(
                "schedule name must not be empty".into(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            expression: expression.trim().to_string(),
            schedule: parse_expression(expression)?,
            job_type,
            payload: Arc::new(|| serde_json::json!({})),
            dedup_key: format!("schedule:{name}"),
        })
    }

    /// Payload built fresh for every run
    pub fn with_payload<F>(mut self, payload: F) -> Self
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.payload = Arc::new(payload);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    /// First fire time strictly after `after`
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Whether a fire time falls in `(from, to]`
    fn fires_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.next_fire(from).map(|t| t <= to).unwrap_or(false)
    }
}

/// Parse a crontab expression, accepting the classic five-field form.
pub fn parse_expression(expression: &str) -> Result<cron::Schedule, QueueError> {
    let expression = expression.trim();
    let normalized = match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        _ => expression.to_string(),
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        QueueError::Configuration(format!("invalid cron expression '{expression}': {e}"))
    })
}

struct Tracked {
    entry: ScheduleEntry,
    last_checked: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    queue: Queue,
    entries: Vec<Tracked>,
    tick: Duration,
    catch_up: Option<Duration>,
}

impl Scheduler {
    pub fn new(queue: Queue) -> Self {
        Self {
            queue,
            entries: Vec::new(),
            tick: Duration::from_secs(1),
            catch_up: None,
        }
    }

    /// Clamped to between 10ms and one minute.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.clamp(Duration::from_millis(10), Duration::from_secs(60));
        self
    }

    /// On the first tick, also fire entries whose time passed within `window`
    /// before startup. Without this, runs missed while the process was down are
    /// not made up.
    pub fn with_catch_up(mut self, window: Duration) -> Self {
        self.catch_up = Some(window);
        self
    }

    pub fn add(&mut self, entry: ScheduleEntry) -> &mut Self {
        info!(
            schedule = %entry.name,
            cron = %entry.expression,
            job_type = %entry.job_type,
            next = ?entry.next_fire(Utc::now()),
            "Registered schedule"
        );
        self.entries.push(Tracked {
            entry,
            last_checked: None,
        });
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter().map(|t| &t.entry)
    }

    /// Evaluate every entry against `now` and enqueue the ones that are due.
    /// Several fire times elapsed since the previous tick still produce a
    /// single job.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut enqueued = Vec::new();
        let first_window = self
            .catch_up
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(now);

        for tracked in &mut self.entries {
            let from = tracked.last_checked.unwrap_or(first_window);
            if !tracked.entry.fires_between(from, now) {
                tracked.last_checked = Some(now);
                continue;
            }

            let entry = &tracked.entry;
            let options = EnqueueOptions::default().with_dedup_key(entry.dedup_key.clone());
            match self
                .queue
                .enqueue_value(entry.job_type, (entry.payload)(), options)
                .await
            {
                Ok(id) => {
                    info!(schedule = %entry.name, job_id = %id, job_type = %entry.job_type, "Scheduled job enqueued");
                    enqueued.push(id);
                    tracked.last_checked = Some(now);
                }
                Err(QueueError::Duplicate { existing, .. }) => {
                    debug!(schedule = %entry.name, %existing, "Previous run still in flight, skipping");
                    tracked.last_checked = Some(now);
                }
                // Leave last_checked alone so the next tick tries again
                Err(e) => {
                    error!(schedule = %entry.name, error = %e, "Failed to enqueue scheduled job");
                }
            }
        }

        enqueued
    }

    /// Run the tick loop until `shutdown` flips to true.
    pub fn start(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(entries = self.entries.len(), tick_ms = self.tick.as_millis() as u64, "Scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        self.tick(Utc::now()).await;
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::job::JobStatus;
    use crate::memory::MemoryJobStore;
    use chrono::TimeZone;

    fn queue() -> Queue {
        Queue::new(
            "meeting-jobs",
            Arc::new(MemoryJobStore::new()),
            EventBus::default(),
        )
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_expression_fires_on_second_zero() {
        let entry = ScheduleEntry::new("cleanup", "0 2 * * *", JobType::CleanupOldFiles).unwrap();
        assert_eq!(entry.next_fire(at(1, 0, 0)), Some(at(2, 0, 0)));
        assert_eq!(entry.dedup_key(), "schedule:cleanup");
    }

    #[test]
    fn test_invalid_expression_is_configuration_error() {
        let err = ScheduleEntry::new("bad", "every night", JobType::CleanupOldFiles).unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));

        let err = ScheduleEntry::new("", "0 2 * * *", JobType::CleanupOldFiles).unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_no_backfill_on_first_tick() {
        let mut scheduler = Scheduler::new(queue());
        scheduler.add(ScheduleEntry::new("cleanup", "0 2 * * *", JobType::CleanupOldFiles).unwrap());

        // 02:00 already passed today; without catch-up it is not made up
        assert!(scheduler.tick(at(3, 0, 0)).await.is_empty());
        assert!(scheduler.tick(at(3, 0, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_window_fires_missed_run_once() {
        let mut scheduler = Scheduler::new(queue()).with_catch_up(Duration::from_secs(6 * 3600));
        scheduler.add(ScheduleEntry::new("cleanup", "0 2 * * *", JobType::CleanupOldFiles).unwrap());

        assert_eq!(scheduler.tick(at(3, 0, 0)).await.len(), 1);
        assert!(scheduler.tick(at(3, 0, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_fires_when_time_passes() {
        let queue = queue();
        let mut scheduler = Scheduler::new(queue.clone());
        scheduler.add(
            ScheduleEntry::new("cleanup", "0 2 * * *", JobType::CleanupOldFiles)
                .unwrap()
                .with_payload(|| serde_json::json!({ "retention_days": 30 })),
        );

        assert!(scheduler.tick(at(1, 59, 59)).await.is_empty());
        let ids = scheduler.tick(at(2, 0, 0)).await;
        assert_eq!(ids.len(), 1);

        let job = queue.get(ids[0]).await.unwrap();
        assert_eq!(job.job_type, JobType::CleanupOldFiles);
        assert_eq!(job.payload["retention_days"], 30);
        assert_eq!(job.dedup_key.as_deref(), Some("schedule:cleanup"));
    }

    #[tokio::test]
    async fn test_missed_ticks_collapse_to_one_job() {
        let queue = queue();
        let mut scheduler = Scheduler::new(queue.clone());
        scheduler.add(ScheduleEntry::new("every-second", "* * * * * *", JobType::GenerateSummary).unwrap());

        scheduler.tick(at(12, 0, 0)).await;
        assert_eq!(scheduler.tick(at(12, 0, 10)).await.len(), 1);
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped_until_previous_finishes() {
        let queue = queue();
        let mut scheduler = Scheduler::new(queue.clone());
        scheduler.add(ScheduleEntry::new("every-second", "* * * * * *", JobType::CleanupOldFiles).unwrap());

        scheduler.tick(at(12, 0, 0)).await;
        let first = scheduler.tick(at(12, 0, 1)).await;
        assert_eq!(first.len(), 1);

        // Still pending, then active: both block the next run
        assert!(scheduler.tick(at(12, 0, 2)).await.is_empty());
        let claimed = queue
            .store()
            .claim_next("meeting-jobs", "w1", &[JobType::CleanupOldFiles], Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(scheduler.tick(at(12, 0, 3)).await.is_empty());

        queue.store().mark_completed(claimed.id, "w1").await.unwrap();
        let next = scheduler.tick(at(12, 0, 4)).await;
        assert_eq!(next.len(), 1);
        assert_ne!(next[0], first[0]);
        assert_eq!(queue.get(first[0]).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = Scheduler::new(queue())
            .with_tick(Duration::from_millis(10))
            .start(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
