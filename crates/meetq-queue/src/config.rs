//! Environment-driven configuration
//!
//! | Variable                     | Default              |
//! |------------------------------|----------------------|
//! | `QUEUE_NAME`                 | `meeting-jobs`       |
//! | `QUEUE_CONCURRENCY`          | `5`                  |
//! | `QUEUE_POLL_INTERVAL_MS`     | `500`                |
//! | `QUEUE_RETRY_BASE_DELAY_MS`  | `1000`               |
//! | `QUEUE_RETRY_MAX_DELAY_MS`   | `300000`             |
//! | `QUEUE_RETRY_JITTER`         | `0.2`                |
//! | `QUEUE_DEFAULT_MAX_ATTEMPTS` | `3`                  |
//! | `QUEUE_LEASE_SECS`           | `300`                |
//! | `QUEUE_HANDLER_TIMEOUT_SECS` | `600`                |
//! | `QUEUE_SHUTDOWN_GRACE_SECS`  | `30`                 |
//! | `QUEUE_REQUIRED_JOB_TYPES`   | `cleanup-old-files`  |
//! | `CLEANUP_CRON_SCHEDULE`      | `0 2 * * *`          |
//! | `RECORDING_RETENTION_DAYS`   | `30`                 |
//! | `SCHEDULER_TICK_MS`          | `1000`               |
//! | `DATABASE_URL`               | `sqlite:meetq.db?mode=rwc` |

use serde::Serialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::{BackoffStrategy, RetryPolicy};
use crate::job::JobType;
use crate::worker::WorkerConfig;

/// Upper bound on `RECORDING_RETENTION_DAYS` (about 100 years)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    pub queue_name: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    pub default_max_attempts: u32,
    pub lease_secs: u64,
    pub handler_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub required_job_types: Vec<JobType>,
    pub cleanup_cron: String,
    pub retention_days: u32,
    pub scheduler_tick_ms: u64,
    pub database_url: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "meeting-jobs".to_string(),
            concurrency: 5,
            poll_interval_ms: 500,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 300_000,
            retry_jitter: 0.2,
            default_max_attempts: 3,
            lease_secs: 300,
            handler_timeout_secs: 600,
            shutdown_grace_secs: 30,
            required_job_types: vec![JobType::CleanupOldFiles],
            cleanup_cron: "0 2 * * *".to_string(),
            retention_days: 30,
            scheduler_tick_ms: 1000,
            database_url: "sqlite:meetq.db?mode=rwc".to_string(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let config = Self {
            queue_name: lookup("QUEUE_NAME").unwrap_or(d.queue_name),
            concurrency: parse(&lookup, "QUEUE_CONCURRENCY", d.concurrency)?,
            poll_interval_ms: parse(&lookup, "QUEUE_POLL_INTERVAL_MS", d.poll_interval_ms)?,
            retry_base_delay_ms: parse(&lookup, "QUEUE_RETRY_BASE_DELAY_MS", d.retry_base_delay_ms)?,
            retry_max_delay_ms: parse(&lookup, "QUEUE_RETRY_MAX_DELAY_MS", d.retry_max_delay_ms)?,
            retry_jitter: parse(&lookup, "QUEUE_RETRY_JITTER", d.retry_jitter)?,
            default_max_attempts: parse(&lookup, "QUEUE_DEFAULT_MAX_ATTEMPTS", d.default_max_attempts)?,
            lease_secs: parse(&lookup, "QUEUE_LEASE_SECS", d.lease_secs)?,
            handler_timeout_secs: parse(&lookup, "QUEUE_HANDLER_TIMEOUT_SECS", d.handler_timeout_secs)?,
            shutdown_grace_secs: parse(&lookup, "QUEUE_SHUTDOWN_GRACE_SECS", d.shutdown_grace_secs)?,
            required_job_types: match lookup("QUEUE_REQUIRED_JOB_TYPES") {
                Some(raw) => parse_job_types(&raw)?,
                None => d.required_job_types,
            },
            cleanup_cron: lookup("CLEANUP_CRON_SCHEDULE").unwrap_or(d.cleanup_cron),
            retention_days: parse(&lookup, "RECORDING_RETENTION_DAYS", d.retention_days)?,
            scheduler_tick_ms: parse(&lookup, "SCHEDULER_TICK_MS", d.scheduler_tick_ms)?,
            database_url: lookup("DATABASE_URL").unwrap_or(d.database_url),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("QUEUE_NAME must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("QUEUE_CONCURRENCY must be at least 1".into()));
        }
        if !(1..=60_000).contains(&self.poll_interval_ms) {
            return Err(ConfigError::Invalid(
                "QUEUE_POLL_INTERVAL_MS must be between 1 and 60000".into(),
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Invalid(format!(
                "RECORDING_RETENTION_DAYS must not exceed {MAX_RETENTION_DAYS}"
            )));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "QUEUE_DEFAULT_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Invalid(
                "QUEUE_RETRY_JITTER must be between 0 and 1".into(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::Invalid(
                "QUEUE_RETRY_MAX_DELAY_MS must not be below QUEUE_RETRY_BASE_DELAY_MS".into(),
            ));
        }
        if self.lease_secs == 0 {
            return Err(ConfigError::Invalid("QUEUE_LEASE_SECS must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.default_max_attempts,
            backoff: BackoffStrategy::Exponential {
                base_ms: self.retry_base_delay_ms,
                max_ms: self.retry_max_delay_ms,
            },
            jitter: self.retry_jitter,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(self.concurrency)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_lease(Duration::from_secs(self.lease_secs))
            .with_handler_timeout(Duration::from_secs(self.handler_timeout_secs))
            .with_shutdown_grace(Duration::from_secs(self.shutdown_grace_secs))
            .with_required_types(self.required_job_types.iter().copied())
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn parse_job_types(raw: &str) -> Result<Vec<JobType>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<JobType>()
                .map_err(|e| ConfigError::Invalid(format!("QUEUE_REQUIRED_JOB_TYPES: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.queue_name, "meeting-jobs");
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.required_job_types, vec![JobType::CleanupOldFiles]);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.delay(1), Duration::from_millis(1000));
    }

    #[test]
    fn test_overrides() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("QUEUE_NAME", "uploads"),
            ("QUEUE_CONCURRENCY", "2"),
            ("QUEUE_REQUIRED_JOB_TYPES", "transcribe-audio, generate-summary"),
            ("QUEUE_LEASE_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.queue_name, "uploads");
        let worker = config.worker_config();
        assert_eq!(worker.concurrency, 2);
        assert_eq!(worker.lease, Duration::from_secs(30));
        assert_eq!(
            worker.required_types,
            vec![JobType::TranscribeAudio, JobType::GenerateSummary]
        );
    }

    #[test]
    fn test_empty_required_types_disables_check() {
        let config = QueueConfig::from_lookup(lookup(&[("QUEUE_REQUIRED_JOB_TYPES", "")])).unwrap();
        assert!(config.required_job_types.is_empty());
    }

    #[test]
    fn test_unparsable_values_are_rejected() {
        for vars in [
            [("QUEUE_CONCURRENCY", "lots")],
            [("QUEUE_CONCURRENCY", "0")],
            [("QUEUE_RETRY_JITTER", "1.5")],
            [("QUEUE_POLL_INTERVAL_MS", "0")],
            [("QUEUE_POLL_INTERVAL_MS", "120000")],
            [("RECORDING_RETENTION_DAYS", "4000000000")],
            [("QUEUE_REQUIRED_JOB_TYPES", "send-invoice")],
        ] {
            let err = QueueConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{vars:?}");
        }
    }

    #[test]
    fn test_poll_interval_bounds() {
        let slowest = QueueConfig::from_lookup(lookup(&[("QUEUE_POLL_INTERVAL_MS", "60000")]))
            .unwrap()
            .worker_config();
        assert_eq!(slowest.poll_interval, Duration::from_secs(60));

        let err = QueueConfig::from_lookup(lookup(&[("QUEUE_POLL_INTERVAL_MS", "60001")]))
            .unwrap_err();
        assert!(err.to_string().contains("QUEUE_POLL_INTERVAL_MS"));
    }
}
