//! Backoff and jitter strategies for retry delays.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to spread retries of many jobs apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum handler attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Un-jittered delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> u64 {
        let base = self.base_delay_ms;
        let n = attempt.max(1);

        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(n - 1))
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(n)),
            BackoffStrategy::Constant => base,
        };

        delay.min(self.max_delay_ms)
    }

    /// Jittered delay after failed attempt number `attempt`.
    ///
    /// `previous_ms` is the last delay used for the same key; only the
    /// decorrelated strategy looks at it.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, previous_ms: Option<u64>) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        let mut rng = rand::thread_rng();

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rng.gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rng.gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = self.base_delay_ms.min(self.max_delay_ms);
                let prev = previous_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(self.max_delay_ms);
                if upper <= base {
                    base
                } else {
                    rng.gen_range(base..=upper)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}
