//! Job records and stage results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{JobId, JobStatus, Payload, Stage};

/// Output of one pipeline stage.
///
/// Owned by the job until the next stage completes or the job reaches a
/// terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The owning job.
    pub job_id: JobId,
    /// The stage that produced the result.
    pub stage: Stage,
    /// The result, inline or in object storage.
    pub payload: Payload,
    /// When the stage finished.
    pub produced_at: DateTime<Utc>,
}

impl StageResult {
    /// Creates a new stage result.
    #[must_use]
    pub fn new(job_id: JobId, stage: Stage, payload: Payload) -> Self {
        Self {
            job_id,
            stage,
            payload,
            produced_at: Utc::now(),
        }
    }
}

/// The state store's record of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub job_id: JobId,
    /// The submitted prompt.
    pub prompt: String,
    /// Stages to run, in order.
    pub stages: Vec<Stage>,
    /// The most recently started stage.
    pub current_stage: Option<Stage>,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Handler attempts per stage.
    pub attempts: BTreeMap<Stage, u32>,
    /// Stages that completed, in completion order.
    pub completed_stages: Vec<Stage>,
    /// Stages whose compensation ran successfully.
    pub compensated_stages: Vec<Stage>,
    /// Output of the latest completed stage.
    pub pending_result: Option<StageResult>,
    /// Set when a client asked for cancellation.
    pub cancel_requested: bool,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job last changed.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a pending job.
    #[must_use]
    pub fn new(job_id: JobId, prompt: impl Into<String>, stages: Vec<Stage>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            prompt: prompt.into(),
            stages,
            current_stage: None,
            status: JobStatus::Pending,
            attempts: BTreeMap::new(),
            completed_stages: Vec::new(),
            compensated_stages: Vec::new(),
            pending_result: None,
            cancel_requested: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Position of `stage` in this job's pipeline.
    #[must_use]
    pub fn stage_index(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }

    /// The first stage of the pipeline.
    #[must_use]
    pub fn first_stage(&self) -> Option<Stage> {
        self.stages.first().copied()
    }

    /// The stage that follows `stage`, or `None` if it is the last one.
    #[must_use]
    pub fn next_stage_after(&self, stage: Stage) -> Option<Stage> {
        self.stage_index(stage)
            .and_then(|idx| self.stages.get(idx + 1))
            .copied()
    }

    /// Returns true if `stage` has completed.
    #[must_use]
    pub fn is_stage_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Returns true if every stage has completed.
    #[must_use]
    pub fn all_stages_completed(&self) -> bool {
        self.stages.iter().all(|s| self.is_stage_completed(*s))
    }

    /// Number of handler attempts recorded for `stage`.
    #[must_use]
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Returns true if the job can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the externally visible status.
    #[must_use]
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.job_id,
            stage: self.current_stage,
            status: self.status,
            cancel_requested: self.cancel_requested,
            error: self.error.clone(),
        }
    }
}

/// Answer of the status query: `{stage, status}` plus context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    /// The job.
    pub job_id: JobId,
    /// The most recently started stage.
    pub stage: Option<Stage>,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Whether cancellation was requested.
    pub cancel_requested: bool,
    /// Failure or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
