//! Retry policy with exponential backoff
//!
//! Application, AI and robot strategies that fail are retried before the
//! token is failed: exponential backoff starting at 100ms, doubling each
//! attempt, with ±20% jitter, for at most 3 attempts by default.
//! Activities override the attempt count and base delay through their
//! `retry` block.

use rand::Rng;
use std::time::Duration;

use crate::graph::RetryOverride;

/// Backoff configuration for retrying failed strategy calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: usize,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Multiplier applied per retry
    pub factor: f64,
    /// Jitter fraction applied to every delay (0.2 = ±20%)
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Apply a per-activity override on top of this policy.
    pub fn overridden(&self, over: Option<&RetryOverride>) -> Self {
        let mut policy = *self;
        if let Some(over) = over {
            if let Some(max) = over.max_attempts {
                policy.max_attempts = max;
            }
            if let Some(base) = over.base_delay_ms {
                policy.base_delay_ms = base;
            }
        }
        policy
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `base * factor^attempt`, jittered.
    pub fn delay(&self, attempt: usize) -> Duration {
        let base = self.base_delay_ms as f64 * self.factor.powi(attempt as i32);
        let jittered = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            base * (1.0 + spread)
        } else {
            base
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}
