//! Retry budget and exponential backoff

use crate::{SyncConfig, SyncError};
use std::time::Duration;

/// What to do with an entry after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay
    RetryAfter(Duration),
    /// Keep the entry but don't count the attempt (suspended or offline)
    Hold,
    /// Give up and mark the entity `error`
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub quota_multiplier: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: config.backoff_base,
            max: config.backoff_max,
            quota_multiplier: config.quota_backoff_multiplier,
        }
    }

    /// Delay before attempt number `failed_attempts + 1`.
    ///
    /// `base * 2^(failed_attempts - 1)`, capped at `max`; zero before any failure.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let shift = failed_attempts.saturating_sub(1);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }

    /// Decide the fate of an entry whose attempt number `failed_attempts`
    /// just failed with `error`.
    pub fn decide(&self, error: &SyncError, failed_attempts: u32) -> RetryDecision {
        if error.is_auth() || matches!(error, SyncError::Offline) {
            return RetryDecision::Hold;
        }
        if !error.is_retryable() || failed_attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = self.backoff(failed_attempts);
        if error.is_quota() {
            let stretched = delay.saturating_mul(self.quota_multiplier).min(self.max);
            RetryDecision::RetryAfter(stretched)
        } else {
            RetryDecision::RetryAfter(delay)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(2),
            max: Duration::from_secs(10),
            quota_multiplier: 4,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(200), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let policy = policy();
        let err = SyncError::Network("reset".into());
        assert_eq!(
            policy.decide(&err, 1),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(&err, 2),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(policy.decide(&err, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_quota_backs_off_longer() {
        let policy = policy();
        let err = SyncError::Quota("writes/min".into());
        assert_eq!(
            policy.decide(&err, 1),
            RetryDecision::RetryAfter(Duration::from_secs(8))
        );
        assert_eq!(
            policy.decide(&err, 2),
            RetryDecision::RetryAfter(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_fatal_and_auth_errors() {
        let policy = policy();
        assert_eq!(
            policy.decide(&SyncError::Data("bad payload".into()), 1),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(&SyncError::Auth("expired".into()), 1),
            RetryDecision::Hold
        );
        assert_eq!(policy.decide(&SyncError::Offline, 5), RetryDecision::Hold);
    }
}
