//! Core domain model types for inferflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Job identifiers and pipeline stages
//! - Job and delivery status enums
//! - The event envelope, its payload and typed bodies
//! - Job records, stage results and dead letters

mod dead_letter;
mod event;
mod ids;
mod job;
mod stage;
mod status;

pub use dead_letter::DeadLetter;
pub use event::{
    Event, EventBody, EventType, JobCancelled, JobFailed, JobSubmitted, Payload, StepKey,
    CURRENT_SCHEMA_VERSION,
};
pub use ids::JobId;
pub use job::{Job, JobStatusView, StageResult};
pub use stage::{validate_pipeline, Stage};
pub use status::{DeliveryState, JobStatus};
