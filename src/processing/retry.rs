//! Retry logic and policies
//!
//! This module contains the backoff strategies and the retry policy that
//! decide whether a failed work item is rescheduled and when.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::FailureKind;

/// Delay schedule between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry as soon as a worker is free
    Immediate,
    /// Fixed interval between retries
    Fixed {
        /// Interval between retry attempts
        interval: Duration,
    },
    /// Exponential backoff with optional jitter
    ExponentialBackoff {
        /// Delay before the first retry
        initial_delay: Duration,
        /// Multiplier for each subsequent retry
        multiplier: f64,
        /// Maximum delay between retries
        max_delay: Duration,
        /// Spread delays by ±25%
        jitter: bool,
    },
    /// Linear backoff (delay increases linearly)
    LinearBackoff {
        /// Delay before the first retry
        initial_delay: Duration,
        /// Amount to add to delay for each retry
        increment: Duration,
        /// Maximum delay between retries
        max_delay: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(15 * 60),
            jitter: false,
        }
    }
}

impl RetryStrategy {
    /// Create a fixed interval retry strategy
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed { interval }
    }

    /// Create an exponential backoff strategy without jitter
    pub fn exponential_backoff(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self::ExponentialBackoff {
            initial_delay,
            multiplier,
            max_delay,
            jitter: false,
        }
    }

    /// Create a linear backoff strategy
    pub fn linear_backoff(initial_delay: Duration, increment: Duration, max_delay: Duration) -> Self {
        Self::LinearBackoff {
            initial_delay,
            increment,
            max_delay,
        }
    }

    /// Calculate the delay before retry number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let steps = attempt.max(1) - 1;
        match self {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Fixed { interval } => *interval,
            RetryStrategy::ExponentialBackoff {
                initial_delay,
                multiplier,
                max_delay,
                jitter,
            } => {
                let max_ms = max_delay.as_millis() as f64;
                let mut delay = initial_delay.as_millis() as f64
                    * multiplier.powi(steps.min(i32::MAX as u32) as i32);
                if !delay.is_finite() {
                    delay = max_ms;
                }

                // Apply maximum delay cap
                delay = delay.min(max_ms);

                if *jitter {
                    let jitter_amount = delay * 0.25;
                    let random_factor = fastrand::f64() * 2.0 - 1.0;
                    delay = (delay + jitter_amount * random_factor).clamp(0.0, max_ms);
                }

                Duration::from_millis(delay.max(0.0) as u64)
            }
            RetryStrategy::LinearBackoff {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = increment
                    .checked_mul(steps)
                    .and_then(|extra| initial_delay.checked_add(extra))
                    .unwrap_or(*max_delay);
                delay.min(*max_delay)
            }
        }
    }
}

/// Retry budget plus backoff schedule for one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff schedule
    pub strategy: RetryStrategy,
    /// Maximum number of retries after the first execution
    pub retry_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            retry_limit: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy, retry_limit: u32) -> Self {
        Self {
            strategy,
            retry_limit,
        }
    }

    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            strategy: RetryStrategy::Immediate,
            retry_limit: 0,
        }
    }

    /// Check if an item that has had `attempt_count` retries and just failed
    /// with `kind` gets another one.
    pub fn should_retry(&self, kind: FailureKind, attempt_count: u32) -> bool {
        !kind.is_permanent() && attempt_count < self.retry_limit
    }

    /// When retry number `attempt` (1-based) becomes available.
    pub fn calculate_retry_time(&self, attempt: u32) -> DateTime<Utc> {
        let delay = self.strategy.calculate_delay(attempt);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
