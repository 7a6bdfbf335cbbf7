//! Retry and dead-letter policy.
//!
//! Each `(job_id, step)` pair owns a small state machine:
//! `Pending -> Retrying -> {Succeeded, DeadLettered}`. Transient failures
//! are retried with backoff until the attempt limit; permanent failures
//! and exhausted retries are dead-lettered exactly once.

mod backoff;
mod policy;

pub use backoff::{BackoffStrategy, JitterStrategy, RetryConfig};
pub use policy::{DeliveryRecord, RetryDecision, RetryPolicy};
