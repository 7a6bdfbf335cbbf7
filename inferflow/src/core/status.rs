//! Job and delivery status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job was accepted but no stage has started.
    Pending,
    /// A stage is running or the next stage is queued.
    InProgress,
    /// All stages completed.
    Completed,
    /// A stage failed and compensation has finished.
    Failed,
    /// A stage failed and completed stages are being undone.
    Compensating,
    /// The job was cancelled between stages.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Compensating => write!(f, "compensating"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Returns true if the job can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the job finished successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Delivery state of one `(job, stage)` handler invocation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// First attempt is running.
    Pending,
    /// At least one attempt failed and another is scheduled.
    Retrying,
    /// The handler returned success.
    Succeeded,
    /// Attempts are exhausted or the failure was permanent.
    DeadLettered,
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Retrying => write!(f, "retrying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

impl DeliveryState {
    /// Returns true if no further attempts will be made.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
        assert_eq!(JobStatus::Compensating.to_string(), "compensating");
    }

    #[test]
    fn test_job_status_is_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::Compensating.is_terminal());
    }

    #[test]
    fn test_job_status_serialize() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);

        let deserialized: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, JobStatus::InProgress);
    }

    #[test]
    fn test_delivery_state_terminal() {
        assert!(DeliveryState::DeadLettered.is_terminal());
        assert!(DeliveryState::Succeeded.is_terminal());
        assert!(!DeliveryState::Retrying.is_terminal());
        assert_eq!(DeliveryState::default(), DeliveryState::Pending);
    }
}
