//! Controller tuning: requeue delays, concurrency and the conflict-retry backoff.

use std::time::Duration;

/// Backoff for the optimistic write loop: `steps` attempts, the first retry
/// after `base`, each later one `factor` times longer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    pub steps: u32,
    pub base: Duration,
    pub factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self { steps: 5, base: Duration::from_millis(10), factor: 1.0 }
    }
}

impl RetryBackoff {
    /// Delay before retry number `n` (1-based). Saturates at `Duration::MAX`.
    pub fn delay(&self, n: u32) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 { self.factor } else { 1.0 };
        let exp = n.saturating_sub(1).min(i32::MAX as u32) as i32;
        Duration::try_from_secs_f64(self.base.as_secs_f64() * factor.powi(exp)).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Re-check delay while deletion is blocked on running targets.
    pub deletion_recheck: Duration,
    /// Delay used when a pass asks for an immediate requeue.
    pub requeue_backoff: Duration,
    /// Delay before retrying a failed pass.
    pub error_backoff: Duration,
    /// Maximum reconciles in flight across distinct RuleSets.
    pub concurrency: usize,
    pub expectation_ttl: Duration,
    pub retry: RetryBackoff,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            deletion_recheck: Duration::from_secs(5),
            requeue_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            concurrency: 10,
            expectation_ttl: Duration::from_secs(300),
            retry: RetryBackoff::default(),
        }
    }
}
