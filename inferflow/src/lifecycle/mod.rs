//! Job lifecycle notifications.
//!
//! Sinks receive one notification per observable job milestone. Terminal
//! notifications (`job.completed`, `job.failed`, `job.cancelled`) are
//! emitted exactly once per job.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{JobId, Stage};

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A job was accepted.
    #[serde(rename = "job.created")]
    JobCreated,
    /// A stage started running.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage stored its result.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A failed attempt will be retried.
    #[serde(rename = "retry.scheduled")]
    RetryScheduled,
    /// An event was routed to the dead-letter channel.
    #[serde(rename = "event.dead_lettered")]
    DeadLettered,
    /// Compensation of a failed job began.
    #[serde(rename = "compensation.started")]
    CompensationStarted,
    /// A completed stage was undone.
    #[serde(rename = "stage.compensated")]
    StageCompensated,
    /// A compensator failed.
    #[serde(rename = "compensation.failed")]
    CompensationFailed,
    /// A stage result was dropped because the job was cancelled.
    #[serde(rename = "result.discarded")]
    ResultDiscarded,
    /// The job completed.
    #[serde(rename = "job.completed")]
    JobCompleted,
    /// The job failed.
    #[serde(rename = "job.failed")]
    JobFailed,
    /// The job was cancelled.
    #[serde(rename = "job.cancelled")]
    JobCancelled,
}

impl NotificationKind {
    /// Dotted name of the notification.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobCreated => "job.created",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::RetryScheduled => "retry.scheduled",
            Self::DeadLettered => "event.dead_lettered",
            Self::CompensationStarted => "compensation.started",
            Self::StageCompensated => "stage.compensated",
            Self::CompensationFailed => "compensation.failed",
            Self::ResultDiscarded => "result.discarded",
            Self::JobCompleted => "job.completed",
            Self::JobFailed => "job.failed",
            Self::JobCancelled => "job.cancelled",
        }
    }

    /// Returns true for notifications that end a job.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::JobCompleted | Self::JobFailed | Self::JobCancelled)
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// What happened.
    pub kind: NotificationKind,
    /// The job it happened to.
    pub job_id: JobId,
    /// The stage involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Extra detail such as a failure reason or retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Notification {
    /// Creates a notification without stage or detail.
    #[must_use]
    pub fn new(kind: NotificationKind, job_id: JobId) -> Self {
        Self {
            kind,
            job_id,
            stage: None,
            detail: None,
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Sets the stage if one is given.
    #[must_use]
    pub fn with_optional_stage(mut self, stage: Option<Stage>) -> Self {
        self.stage = stage;
        self
    }

    /// Sets the detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}
