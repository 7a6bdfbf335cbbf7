//! Per-step delivery state machine.

use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::RetryConfig;
use crate::core::{DeliveryState, JobId, StepKey};
use crate::errors::{ErrorKind, HandlerError};

/// Delivery bookkeeping for one `(job_id, step)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    /// Current state.
    pub state: DeliveryState,
    /// Handler attempts started so far.
    pub attempts: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Delay used before the most recent retry.
    pub last_delay_ms: Option<u64>,
}

impl Default for DeliveryRecord {
    fn default() -> Self {
        Self {
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
            last_delay_ms: None,
        }
    }
}

/// What the consumer should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then run attempt number `attempt`.
    Retry {
        /// The attempt about to run (1-based).
        attempt: u32,
        /// Backoff before it.
        delay: Duration,
    },
    /// Give up and publish to the dead-letter channel.
    DeadLetter {
        /// Attempts made.
        attempts: u32,
        /// Final failure message.
        reason: String,
        /// Classification of the final failure.
        kind: ErrorKind,
    },
    /// The step was already dead-lettered; do nothing.
    AlreadyDeadLettered,
}

/// Tracks attempts per `(job_id, step)` and decides retry versus
/// dead-letter.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    records: DashMap<(JobId, StepKey), DeliveryRecord>,
}

impl RetryPolicy {
    /// Creates a policy from retry configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Returns the retry configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Records the start of an attempt and returns its 1-based number.
    ///
    /// Returns `None` when the step is dead-lettered: a redelivered event
    /// for a dead-lettered step must not run again. A redelivery after
    /// success starts a fresh count.
    pub fn begin_attempt(&self, job_id: JobId, step: StepKey) -> Option<u32> {
        let mut record = self.records.entry((job_id, step)).or_default();
        match record.state {
            DeliveryState::DeadLettered => None,
            DeliveryState::Succeeded => {
                *record = DeliveryRecord {
                    state: DeliveryState::Retrying,
                    attempts: 1,
                    ..DeliveryRecord::default()
                };
                Some(1)
            }
            DeliveryState::Pending | DeliveryState::Retrying => {
                record.state = DeliveryState::Retrying;
                record.attempts += 1;
                Some(record.attempts)
            }
        }
    }

    /// Marks the step as succeeded.
    pub fn on_success(&self, job_id: JobId, step: StepKey) {
        let mut record = self.records.entry((job_id, step)).or_default();
        if record.state != DeliveryState::DeadLettered {
            record.state = DeliveryState::Succeeded;
            record.last_error = None;
        }
    }

    /// Decides what follows a failed attempt.
    ///
    /// Permanent errors and exhausted attempts dead-letter the step. The
    /// transition to `DeadLettered` happens once; later calls return
    /// [`RetryDecision::AlreadyDeadLettered`].
    pub fn on_failure(&self, job_id: JobId, step: StepKey, error: &HandlerError) -> RetryDecision {
        let mut record = self.records.entry((job_id, step)).or_default();
        if record.state == DeliveryState::DeadLettered {
            return RetryDecision::AlreadyDeadLettered;
        }

        record.last_error = Some(error.message().to_string());
        let attempts = record.attempts.max(1);

        if !error.is_retryable() || attempts >= self.config.max_attempts {
            record.state = DeliveryState::DeadLettered;
            warn!(
                job_id = %job_id,
                step = %step,
                attempts,
                error_kind = %error.kind(),
                "Step dead-lettered"
            );
            return RetryDecision::DeadLetter {
                attempts,
                reason: error.message().to_string(),
                kind: error.kind(),
            };
        }

        record.state = DeliveryState::Retrying;
        let delay = self.config.delay_for_attempt(attempts, record.last_delay_ms);
        record.last_delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));

        debug!(
            job_id = %job_id,
            step = %step,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        RetryDecision::Retry {
            attempt: attempts + 1,
            delay,
        }
    }

    /// Returns a snapshot of a step's record.
    #[must_use]
    pub fn record(&self, job_id: JobId, step: StepKey) -> Option<DeliveryRecord> {
        self.records.get(&(job_id, step)).map(|r| r.value().clone())
    }

    /// Drops all records of a job. Called once the job is terminal.
    pub fn forget_job(&self, job_id: JobId) -> usize {
        let before = self.records.len();
        self.records.retain(|(id, _), _| *id != job_id);
        before.saturating_sub(self.records.len())
    }

    /// Number of tracked steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no steps are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
