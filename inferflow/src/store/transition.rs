//! Job state transitions and the rules that guard them.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::{Job, JobStatus, Stage, StageResult};
use crate::errors::InvalidTransitionError;

/// A requested change to a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// Begin running a stage.
    StartStage {
        /// The stage.
        stage: Stage,
    },
    /// Count one handler attempt of the running stage.
    RecordAttempt {
        /// The stage.
        stage: Stage,
    },
    /// Store a stage's output and mark it completed.
    CompleteStage {
        /// The stage output.
        result: StageResult,
    },
    /// Enter compensation after a failure.
    BeginCompensation {
        /// The stage that failed, if any.
        failed_stage: Option<Stage>,
        /// Why the job failed.
        reason: String,
    },
    /// Record that a completed stage was undone.
    MarkCompensated {
        /// The stage.
        stage: Stage,
    },
    /// Finish as failed.
    MarkFailed {
        /// Why the job failed.
        reason: String,
    },
    /// Finish successfully.
    Complete,
    /// Ask for the job to stop at the next stage boundary.
    RequestCancel {
        /// Why cancellation was requested.
        reason: String,
    },
    /// Finish as cancelled.
    Cancel {
        /// Why the job was cancelled.
        reason: String,
    },
}

impl Transition {
    /// Short name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartStage { .. } => "start_stage",
            Self::RecordAttempt { .. } => "record_attempt",
            Self::CompleteStage { .. } => "complete_stage",
            Self::BeginCompensation { .. } => "begin_compensation",
            Self::MarkCompensated { .. } => "mark_compensated",
            Self::MarkFailed { .. } => "mark_failed",
            Self::Complete => "complete",
            Self::RequestCancel { .. } => "request_cancel",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The job changed.
    Applied(Job),
    /// The job was already in the requested state; nothing changed.
    AlreadyApplied(Job),
}

impl TransitionOutcome {
    /// Returns true if the job changed.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// The job after the transition.
    #[must_use]
    pub fn job(&self) -> &Job {
        match self {
            Self::Applied(job) | Self::AlreadyApplied(job) => job,
        }
    }

    /// Consumes the outcome, returning the job.
    #[must_use]
    pub fn into_job(self) -> Job {
        match self {
            Self::Applied(job) | Self::AlreadyApplied(job) => job,
        }
    }
}

/// Applies `transition` to `job` in place.
///
/// Returns `Ok(true)` when the job changed and `Ok(false)` when the
/// transition had already been applied, which makes redelivered events
/// harmless. The job is left untouched on error.
///
/// Stages only move forward: a stage can start once every stage before it
/// completed, and a completed stage is never started again.
pub fn apply_transition(job: &mut Job, transition: &Transition) -> Result<bool, InvalidTransitionError> {
    match transition {
        Transition::StartStage { stage } => {
            let stage = *stage;
            let Some(idx) = job.stage_index(stage) else {
                return reject(job, transition, format!("stage '{stage}' is not part of the pipeline"));
            };
            if job.is_stage_completed(stage) {
                return Ok(false);
            }
            if job.status != JobStatus::Pending && job.status != JobStatus::InProgress {
                return reject(job, transition, "job is not runnable".to_string());
            }
            if let Some(missing) = job.stages[..idx].iter().find(|s| !job.is_stage_completed(**s)) {
                return reject(job, transition, format!("stage '{missing}' has not completed"));
            }
            if job.current_stage == Some(stage) && job.status == JobStatus::InProgress {
                return Ok(false);
            }
            job.current_stage = Some(stage);
            job.status = JobStatus::InProgress;
        }
        Transition::RecordAttempt { stage } => {
            if job.status != JobStatus::InProgress || job.current_stage != Some(*stage) {
                return reject(job, transition, format!("stage '{stage}' is not running"));
            }
            *job.attempts.entry(*stage).or_insert(0) += 1;
        }
        Transition::CompleteStage { result } => {
            let stage = result.stage;
            if result.job_id != job.job_id {
                return reject(job, transition, "result belongs to another job".to_string());
            }
            if job.is_stage_completed(stage) {
                return Ok(false);
            }
            if job.status != JobStatus::InProgress || job.current_stage != Some(stage) {
                return reject(job, transition, format!("stage '{stage}' is not running"));
            }
            job.completed_stages.push(stage);
            job.pending_result = Some(result.clone());
        }
        Transition::BeginCompensation { reason, .. } => match job.status {
            JobStatus::Compensating | JobStatus::Failed => return Ok(false),
            JobStatus::Pending | JobStatus::InProgress => {
                job.status = JobStatus::Compensating;
                job.error = Some(reason.clone());
            }
            JobStatus::Completed | JobStatus::Cancelled => {
                return reject(job, transition, "job already finished".to_string());
            }
        },
        Transition::MarkCompensated { stage } => {
            if job.compensated_stages.contains(stage) {
                return Ok(false);
            }
            if job.status != JobStatus::Compensating {
                return reject(job, transition, "job is not compensating".to_string());
            }
            if !job.is_stage_completed(*stage) {
                return reject(job, transition, format!("stage '{stage}' never completed"));
            }
            job.compensated_stages.push(*stage);
        }
        Transition::MarkFailed { reason } => match job.status {
            JobStatus::Failed => return Ok(false),
            JobStatus::Completed | JobStatus::Cancelled => {
                return reject(job, transition, "job already finished".to_string());
            }
            JobStatus::Pending | JobStatus::InProgress | JobStatus::Compensating => {
                job.status = JobStatus::Failed;
                job.error.get_or_insert_with(|| reason.clone());
                job.pending_result = None;
            }
        },
        Transition::Complete => {
            if job.status == JobStatus::Completed {
                return Ok(false);
            }
            if job.status != JobStatus::InProgress {
                return reject(job, transition, "job is not running".to_string());
            }
            if !job.all_stages_completed() {
                return reject(job, transition, "not every stage has completed".to_string());
            }
            // The final stage result stays on the job as its output.
            job.status = JobStatus::Completed;
        }
        Transition::RequestCancel { .. } => {
            if job.is_terminal() || job.cancel_requested {
                return Ok(false);
            }
            if job.status == JobStatus::Compensating {
                return reject(job, transition, "job is already being compensated".to_string());
            }
            job.cancel_requested = true;
        }
        Transition::Cancel { reason } => {
            if job.status == JobStatus::Cancelled {
                return Ok(false);
            }
            if !job.cancel_requested {
                return reject(job, transition, "cancellation was not requested".to_string());
            }
            if job.status != JobStatus::Pending && job.status != JobStatus::InProgress {
                return reject(job, transition, "job cannot be cancelled now".to_string());
            }
            job.status = JobStatus::Cancelled;
            job.error = Some(reason.clone());
            job.pending_result = None;
        }
    }

    job.updated_at = Utc::now();
    Ok(true)
}

fn reject(job: &Job, transition: &Transition, reason: String) -> Result<bool, InvalidTransitionError> {
    Err(InvalidTransitionError::new(
        job.job_id,
        job.status.to_string(),
        transition.name(),
        reason,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobId, Payload};

    fn job() -> Job {
        Job::new(JobId::new(), "prompt", Stage::ALL.to_vec())
    }

    fn start(job: &mut Job, stage: Stage) -> Result<bool, InvalidTransitionError> {
        apply_transition(job, &Transition::StartStage { stage })
    }

    fn finish(job: &mut Job, stage: Stage) -> Result<bool, InvalidTransitionError> {
        let result = StageResult::new(job.job_id, stage, Payload::inline(serde_json::json!(stage.as_str())));
        apply_transition(job, &Transition::CompleteStage { result })
    }

    fn run(job: &mut Job, stage: Stage) {
        assert!(start(job, stage).unwrap());
        assert!(finish(job, stage).unwrap());
    }

    #[test]
    fn test_happy_path() {
        let mut job = job();
        for stage in Stage::ALL {
            run(&mut job, stage);
        }
        assert!(apply_transition(&mut job, &Transition::Complete).unwrap());

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_stages, Stage::ALL.to_vec());
        assert_eq!(job.pending_result.as_ref().map(|r| r.stage), Some(Stage::Generate));
    }

    #[test]
    fn test_stage_cannot_skip_ahead() {
        let mut job = job();
        let err = start(&mut job, Stage::Rerank).unwrap_err();
        assert!(err.reason.contains("retrieve"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.current_stage.is_none());
    }

    #[test]
    fn test_stage_never_regresses() {
        let mut job = job();
        run(&mut job, Stage::Retrieve);
        run(&mut job, Stage::Rerank);

        // Restarting a completed stage is a no-op, not a regression.
        assert!(!start(&mut job, Stage::Retrieve).unwrap());
        assert_eq!(job.current_stage, Some(Stage::Rerank));
    }

    #[test]
    fn test_duplicate_completion_is_idempotent() {
        let mut job = job();
        run(&mut job, Stage::Retrieve);
        let before = job.clone();

        assert!(!finish(&mut job, Stage::Retrieve).unwrap());
        assert_eq!(job, before);
    }

    #[test]
    fn test_restart_running_stage_is_noop() {
        let mut job = job();
        assert!(start(&mut job, Stage::Retrieve).unwrap());
        assert!(!start(&mut job, Stage::Retrieve).unwrap());
    }

    #[test]
    fn test_record_attempt() {
        let mut job = job();
        start(&mut job, Stage::Retrieve).unwrap();
        let attempt = Transition::RecordAttempt { stage: Stage::Retrieve };
        apply_transition(&mut job, &attempt).unwrap();
        apply_transition(&mut job, &attempt).unwrap();
        assert_eq!(job.attempts_for(Stage::Retrieve), 2);

        let wrong = Transition::RecordAttempt { stage: Stage::Generate };
        assert!(apply_transition(&mut job, &wrong).is_err());
    }

    #[test]
    fn test_complete_requires_all_stages() {
        let mut job = job();
        run(&mut job, Stage::Retrieve);
        assert!(apply_transition(&mut job, &Transition::Complete).is_err());
    }

    #[test]
    fn test_compensation_flow() {
        let mut job = job();
        run(&mut job, Stage::Retrieve);
        run(&mut job, Stage::Rerank);

        let begin = Transition::BeginCompensation {
            failed_stage: Some(Stage::Generate),
            reason: "model crashed".to_string(),
        };
        assert!(apply_transition(&mut job, &begin).unwrap());
        assert!(!apply_transition(&mut job, &begin).unwrap());
        assert_eq!(job.status, JobStatus::Compensating);

        // No new stage may start while compensating.
        assert!(start(&mut job, Stage::Generate).is_err());

        let undo = Transition::MarkCompensated { stage: Stage::Rerank };
        assert!(apply_transition(&mut job, &undo).unwrap());
        assert!(!apply_transition(&mut job, &undo).unwrap());

        let never_ran = Transition::MarkCompensated { stage: Stage::Generate };
        assert!(apply_transition(&mut job, &never_ran).is_err());

        let fail = Transition::MarkFailed { reason: "ignored".to_string() };
        assert!(apply_transition(&mut job, &fail).unwrap());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("model crashed"));
        assert!(job.pending_result.is_none());
    }

    #[test]
    fn test_cancel_requires_request() {
        let mut job = job();
        let cancel = Transition::Cancel { reason: "user".to_string() };
        assert!(apply_transition(&mut job, &cancel).is_err());

        let request = Transition::RequestCancel { reason: "user".to_string() };
        assert!(apply_transition(&mut job, &request).unwrap());
        assert!(!apply_transition(&mut job, &request).unwrap());
        assert!(apply_transition(&mut job, &cancel).unwrap());
        assert!(!apply_transition(&mut job, &cancel).unwrap());
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_releases_pending_result() {
        let mut job = job();
        run(&mut job, Stage::Retrieve);
        assert!(job.pending_result.is_some());

        apply_transition(&mut job, &Transition::RequestCancel { reason: "user".to_string() }).unwrap();
        apply_transition(&mut job, &Transition::Cancel { reason: "user".to_string() }).unwrap();
        assert!(job.pending_result.is_none());
    }

    #[test]
    fn test_terminal_job_rejects_work() {
        let mut job = job();
        apply_transition(&mut job, &Transition::MarkFailed { reason: "x".to_string() }).unwrap();

        assert!(start(&mut job, Stage::Retrieve).is_err());
        assert!(apply_transition(&mut job, &Transition::Complete).is_err());
        // Cancelling a finished job is a no-op.
        assert!(!apply_transition(&mut job, &Transition::RequestCancel { reason: "late".to_string() }).unwrap());
    }

    #[test]
    fn test_transition_serialize() {
        let json = serde_json::to_value(Transition::StartStage { stage: Stage::Rerank }).unwrap();
        assert_eq!(json["transition"], "start_stage");
        assert_eq!(json["stage"], "rerank");
    }
}
