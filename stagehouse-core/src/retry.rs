//! Retry and timeout policy applied by the executor around each stage.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Bounded retry policy for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `retries + 1`.
    pub retries: u32,
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Upper bound for exponential delays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_delay_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay_secs: 300,
            backoff: Backoff::Fixed,
            max_retry_delay_secs: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            retry_delay_secs: 0,
            backoff: Backoff::Fixed,
            max_retry_delay_secs: None,
        }
    }

    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            retry_delay_secs: delay.as_secs(),
            backoff: Backoff::Fixed,
            max_retry_delay_secs: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before attempt `next_attempt` (2-based: the first retry is attempt 2).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let base = self.retry_delay_secs;
        let secs = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let exp = next_attempt.saturating_sub(2).min(32);
                base.saturating_mul(1u64 << exp)
            }
        };
        let capped = match self.max_retry_delay_secs {
            Some(max) => secs.min(max),
            None => secs,
        };
        Duration::from_secs(capped)
    }
}

/// Retry policy plus an optional per-attempt execution timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StagePolicy {
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_secs: Option<u64>,
}

impl StagePolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            execution_timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}
