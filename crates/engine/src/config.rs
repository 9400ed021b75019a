//! Engine configuration and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default whole-workflow deadline.
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(300);
/// Default per-step invocation timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How often a failing step is re-invoked and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay for exponential back-off between attempts.
    pub backoff_base_ms: u64,
    /// Upper bound for a single back-off delay.
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    /// Attempts allowed; a policy never allows fewer than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let millis = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for workflow runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a whole run when the submitter gives none.
    pub global_timeout: Duration,
    /// Per-step invocation timeout when the step declares none.
    pub step_timeout: Duration,
    /// Retry policy for steps that declare none.
    pub retry: RetryPolicy,
    /// Cap on concurrently dispatched steps per run. `None` means the sum of
    /// all agent capacities.
    pub max_in_flight: Option<usize>,
    /// Consecutive failures after which the agent monitor flags an agent.
    pub monitor_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            retry: RetryPolicy::default(),
            max_in_flight: None,
            monitor_threshold: 3,
        }
    }
}

impl EngineConfig {
    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = timeout;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max.max(1));
        self
    }

    pub fn with_monitor_threshold(mut self, threshold: u32) -> Self {
        self.monitor_threshold = threshold.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::default().with_attempts(0).attempts(), 1);
        assert_eq!(RetryPolicy::none().attempts(), 1);
    }

    #[test]
    fn partial_policy_fills_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{ "max_attempts": 5 }"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base_ms, 100);
        assert_eq!(policy.backoff_max_ms, 5_000);
    }
}
