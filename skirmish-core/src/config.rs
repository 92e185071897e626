use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Retry policy applied to transient step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First backoff delay; doubles on every further attempt.
    pub base: Duration,
    /// Backoff ceiling.
    pub cap: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with saturation at the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(multiplier).min(self.cap)
    }
}

/// Tunables for the orchestration and correlation core.
///
/// The defaults are design values, not measured ones; deployments should
/// validate the skew tolerance and correlation window against observed
/// collector clock drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// How far an event's origin timestamp may predate provisioning
    /// completion before it is rejected as out-of-window.
    pub skew_tolerance: Duration,
    /// Sliding window used to group candidate events for linkage.
    pub correlation_window: Duration,
    /// Relative tolerance when matching file-write size to upload size.
    pub size_tolerance: f64,
    pub retry: RetryPolicy,
    /// Per-step driver call timeout; a hang becomes a transient failure.
    pub step_timeout: Duration,
    /// Grace period a cancelled in-flight driver call gets to finish.
    pub cancel_grace: Duration,
    /// Attempts at releasing resources before declaring them orphaned.
    pub compensation_attempts: u32,
    /// How long the monitoring phase drains the adversary stream after the
    /// attack operation reports completion.
    pub monitor_window: Duration,
    /// Terminal runs older than this are swept into teardown.
    pub retention: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            skew_tolerance: Duration::from_secs(5),
            correlation_window: Duration::from_secs(2),
            size_tolerance: 0.10,
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_secs(30),
            compensation_attempts: 3,
            monitor_window: Duration::from_secs(60),
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Permanent(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base > self.retry.cap {
            return Err(CoreError::Permanent(
                "retry base delay exceeds cap".into(),
            ));
        }
        if self.compensation_attempts == 0 {
            return Err(CoreError::Permanent(
                "compensation_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.size_tolerance) {
            return Err(CoreError::Permanent(
                "size_tolerance must be in [0, 1)".into(),
            ));
        }
        if self.correlation_window.is_zero() {
            return Err(CoreError::Permanent(
                "correlation_window must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CoreConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for(3), Duration::from_secs(8));
        assert_eq!(retry.delay_for(10), Duration::from_secs(60)); // capped
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let config = CoreConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            },
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
