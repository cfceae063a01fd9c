//! Retry and backoff policy

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::job::JobType;

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant { delay_ms: u64 },
    /// `min(base_ms * 2^(attempts-1), max_ms)`
    Exponential { base_ms: u64, max_ms: u64 },
}

impl BackoffStrategy {
    /// Un-jittered delay after the given number of failed attempts (1-based).
    pub fn delay(&self, attempts: u32) -> Duration {
        match self {
            Self::Constant { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential { base_ms, max_ms } => {
                let exp = attempts.saturating_sub(1).min(63);
                let ms = base_ms
                    .checked_mul(1u64 << exp)
                    .unwrap_or(u64::MAX)
                    .min(*max_ms);
                Duration::from_millis(ms)
            }
        }
    }

    /// Upper bound for any delay this strategy produces.
    pub fn ceiling(&self) -> Duration {
        match self {
            Self::Constant { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential { max_ms, .. } => Duration::from_millis(*max_ms),
        }
    }
}

/// Attempt ceiling plus backoff for one job type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Fraction of the delay added or removed at random, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base_ms: 1_000,
                max_ms: 300_000,
            },
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, for tests and tight loops
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Constant { delay_ms: 0 },
            jitter: 0.0,
        }
    }

    /// Jittered delay before the next attempt, never above the strategy ceiling.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base = self.backoff.delay(attempts).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * jitter;
        let ms = (base * factor).max(0.0) as u64;
        Duration::from_millis(ms).min(self.backoff.ceiling())
    }

    /// Whether a job that has failed `attempts` times gets another run.
    pub fn should_retry(&self, attempts: u32, max_attempts: u32) -> bool {
        attempts < max_attempts
    }
}

/// Default policy plus per-type overrides
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    overrides: HashMap<JobType, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, job_type: JobType, policy: RetryPolicy) -> Self {
        self.overrides.insert(job_type, policy);
        self
    }

    pub fn for_type(&self, job_type: JobType) -> &RetryPolicy {
        self.overrides.get(&job_type).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_strategy_constant() {
        let strategy = BackoffStrategy::Constant { delay_ms: 5_000 };
        assert_eq!(strategy.delay(1).as_secs(), 5);
        assert_eq!(strategy.delay(3).as_secs(), 5);
        assert_eq!(strategy.delay(10).as_secs(), 5);
    }

    #[test]
    fn test_backoff_strategy_exponential() {
        let strategy = BackoffStrategy::Exponential {
            base_ms: 1_000,
            max_ms: 60_000,
        };
        assert_eq!(strategy.delay(1).as_secs(), 1);
        assert_eq!(strategy.delay(2).as_secs(), 2);
        assert_eq!(strategy.delay(3).as_secs(), 4);
        assert_eq!(strategy.delay(4).as_secs(), 8);
        assert_eq!(strategy.delay(7).as_secs(), 60); // 64s capped
        assert_eq!(strategy.delay(200).as_secs(), 60);
    }

    #[test]
    fn test_next_delay_bounded_by_max() {
        let policy = RetryPolicy {
            max_attempts: 50,
            backoff: BackoffStrategy::Exponential {
                base_ms: 100,
                max_ms: 2_000,
            },
            jitter: 0.2,
        };
        for attempts in 5..50 {
            for _ in 0..20 {
                assert!(policy.next_delay(attempts) <= Duration::from_millis(2_000));
            }
        }
    }

    #[test]
    fn test_next_delay_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.next_delay(3).as_millis();
            // 4000ms +/- 20%
            assert!((3_200..=4_800).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn test_next_delay_non_decreasing_in_expectation() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: BackoffStrategy::Exponential {
                base_ms: 50,
                max_ms: 10_000,
            },
            jitter: 0.2,
        };
        let mean = |attempts: u32| -> f64 {
            (0..500)
                .map(|_| policy.next_delay(attempts).as_millis() as f64)
                .sum::<f64>()
                / 500.0
        };
        let mut previous = 0.0;
        for attempts in 1..10 {
            let m = mean(attempts);
            // Allow a little sampling noise once the ceiling flattens the curve
            assert!(m >= previous * 0.9, "mean dropped at attempt {attempts}");
            previous = m;
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.should_retry(1, 3));
        assert!(policy.should_retry(2, 3));
        assert!(!policy.should_retry(3, 3));
    }

    #[test]
    fn test_per_type_override() {
        let policies = RetryPolicies::new(RetryPolicy::default())
            .with_override(JobType::TranscribeAudio, RetryPolicy::immediate(7));
        assert_eq!(policies.for_type(JobType::TranscribeAudio).max_attempts, 7);
        assert_eq!(policies.for_type(JobType::GenerateSummary).max_attempts, 3);
    }
}
