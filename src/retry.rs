//! # retry
//!
//! Bounded exponential backoff shared by the feed runner and the order
//! submission worker.

use std::time::Duration;

use crate::config::{env_u32, env_u64};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay:   Duration,
    pub max_delay:    Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay:   Duration::from_secs(1),
            max_delay:    Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Submission policy: `ORDER_MAX_RETRIES` attempts, `ORDER_RETRY_DELAY_MS` base.
    pub fn orders_from_env() -> Result<Self, ConfigError> {
        let policy = Self {
            max_attempts: env_u32("ORDER_MAX_RETRIES", 3)?,
            base_delay:   Duration::from_millis(env_u64("ORDER_RETRY_DELAY_MS", 1_000)?),
            max_delay:    Duration::from_secs(30),
        };
        if policy.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key:    "ORDER_MAX_RETRIES",
                reason: "must allow at least one attempt".into(),
            });
        }
        Ok(policy)
    }

    /// Feed reconnect policy. The feed never gives up; only the delay is bounded.
    pub fn feed_from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_attempts: u32::MAX,
            base_delay:   Duration::from_millis(env_u64("FEED_RETRY_BASE_MS", 500)?),
            max_delay:    Duration::from_millis(env_u64("FEED_RETRY_MAX_MS", 30_000)?),
        })
    }

    /// Delay before retry number `retry` (0-based): `base × 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    #[inline]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
