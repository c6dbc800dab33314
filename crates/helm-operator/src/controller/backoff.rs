//! Per-key exponential backoff for failed reconciles

use std::time::Duration;

use dashmap::DashMap;
use helm_common::ObjectKey;

/// Shape of the retry delay curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

/// Failure counts per key, doubling the delay on every consecutive failure
#[derive(Debug, Default)]
pub(crate) struct ErrorBackoff {
    policy: BackoffPolicy,
    failures: DashMap<ObjectKey, u32>,
}

impl ErrorBackoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: DashMap::new(),
        }
    }

    /// Record a failure and return how long to wait before the retry
    pub(crate) fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.entry(key.clone()).or_insert(0);
        let exponent = (*failures).min(31);
        *failures = failures.saturating_add(1);

        self.policy
            .base
            .checked_mul(1u32 << exponent)
            .map_or(self.policy.max, |delay| delay.min(self.policy.max))
    }

    /// Reset after a successful reconcile
    pub(crate) fn forget(&self, key: &ObjectKey) {
        self.failures.remove(key);
    }
}
