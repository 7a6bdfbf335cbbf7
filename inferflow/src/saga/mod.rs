//! Saga coordinator.
//!
//! Chooses the next step after a stage completes, fails jobs whose events
//! were dead-lettered, and undoes completed stages in reverse completion
//! order when a job fails.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::{DeadLetter, Event, EventType, Job, JobFailed, JobId, JobStatus, Payload, Stage};
use crate::dispatch::{DeadLetterObserver, Services};
use crate::errors::{HandlerError, InferflowError, Result};
use crate::lifecycle::{Notification, NotificationKind};
use crate::store::Transition;

/// Undoes the side effects of one completed stage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Compensator: Send + Sync {
    /// The stage this compensator undoes.
    fn stage(&self) -> Stage;

    /// Undoes the stage's effects for a job.
    async fn compensate(&self, job_id: JobId, stage: Stage) -> Result<(), HandlerError>;
}

/// What follows a completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Run this stage.
    Run(Stage),
    /// Every stage is done; the job can complete.
    Finish,
}

/// Outcome of compensating a failed job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Stages undone by this run, in the order they were undone.
    pub compensated: Vec<Stage>,
    /// Completed stages without a compensator.
    pub skipped: Vec<Stage>,
    /// Stages whose compensator failed, with the error.
    pub failed: Vec<(Stage, String)>,
    /// True if the job had already failed and nothing was done.
    pub already_finished: bool,
}

impl CompensationReport {
    /// Returns true if no compensator failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Coordinates stage progression and compensation.
pub struct SagaCoordinator {
    services: Arc<Services>,
    compensators: HashMap<Stage, Arc<dyn Compensator>>,
    compensation_timeout: Duration,
}

impl SagaCoordinator {
    /// Creates a coordinator without compensators.
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            compensators: HashMap::new(),
            compensation_timeout: Duration::from_secs(30),
        }
    }

    /// Registers a compensator, replacing any previous one for its stage.
    #[must_use]
    pub fn with_compensator(mut self, compensator: Arc<dyn Compensator>) -> Self {
        let stage = compensator.stage();
        if self.compensators.insert(stage, compensator).is_some() {
            warn!(stage = %stage, "Replaced compensator");
        }
        self
    }

    /// Sets how long one compensator may run.
    #[must_use]
    pub fn with_compensation_timeout(mut self, timeout: Duration) -> Self {
        self.compensation_timeout = timeout;
        self
    }

    /// Returns the step after `completed`.
    #[must_use]
    pub fn next_step(job: &Job, completed: Stage) -> NextStep {
        job.next_stage_after(completed)
            .map_or(NextStep::Finish, NextStep::Run)
    }

    /// Builds the event that runs `stage`: `PromptReady` for the inference
    /// stage, `StageReady` otherwise.
    #[must_use]
    pub fn trigger_event(job_id: JobId, stage: Stage, payload: Payload) -> Event {
        let event_type = if stage.is_inference() {
            EventType::PromptReady
        } else {
            EventType::StageReady
        };
        Event::stage_data(event_type, job_id, stage, payload)
    }

    /// Builds the event that runs a job's first stage.
    #[must_use]
    pub fn first_trigger(job: &Job) -> Option<Event> {
        let stage = job.first_stage()?;
        let payload = Payload::inline(serde_json::json!({ "prompt": job.prompt }));
        Some(Self::trigger_event(job.job_id, stage, payload))
    }

    /// Fails a job by publishing `JobFailed`.
    ///
    /// Returns false when there is nothing to fail: the job is unknown,
    /// already finished or already being compensated.
    pub async fn abort(&self, job_id: JobId, stage: Option<Stage>, reason: &str) -> Result<bool> {
        let job = match self.services.store.get(job_id).await {
            Ok(job) => job,
            Err(InferflowError::JobNotFound(_)) => {
                warn!(job_id = %job_id, "Cannot fail unknown job");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        if job.is_terminal() || job.status == JobStatus::Compensating {
            debug!(job_id = %job_id, status = %job.status, "Job already finishing; not aborting");
            return Ok(false);
        }

        info!(job_id = %job_id, stage = ?stage, reason, "Failing job");
        let event = Event::from_body(
            job_id,
            &JobFailed {
                stage,
                reason: reason.to_string(),
            },
        )?;
        self.services.publish(event).await?;
        Ok(true)
    }

    /// Compensates completed stages in reverse completion order, then marks
    /// the job failed.
    ///
    /// Stages compensated by an earlier run are skipped, so this is safe to
    /// repeat. A failing compensator is logged and reported; the remaining
    /// stages are still compensated and the job still ends `Failed`.
    pub async fn compensate(
        &self,
        job_id: JobId,
        failed_stage: Option<Stage>,
        reason: &str,
    ) -> Result<CompensationReport> {
        let store = &self.services.store;
        let outcome = store
            .apply(
                job_id,
                Transition::BeginCompensation {
                    failed_stage,
                    reason: reason.to_string(),
                },
            )
            .await?;

        let mut report = CompensationReport::default();
        if outcome.job().is_terminal() {
            report.already_finished = true;
            return Ok(report);
        }
        if outcome.is_applied() {
            self.services
                .notify(
                    Notification::new(NotificationKind::CompensationStarted, job_id)
                        .with_optional_stage(failed_stage)
                        .with_detail(serde_json::json!({ "reason": reason })),
                )
                .await;
        }

        let job = outcome.into_job();
        for stage in job.completed_stages.iter().rev().copied() {
            if job.compensated_stages.contains(&stage) {
                continue;
            }
            let Some(compensator) = self.compensators.get(&stage) else {
                debug!(job_id = %job_id, stage = %stage, "No compensator for stage");
                report.skipped.push(stage);
                continue;
            };

            let result = tokio::time::timeout(self.compensation_timeout, compensator.compensate(job_id, stage))
                .await
                .unwrap_or_else(|_| Err(HandlerError::transient("compensation timed out")));

            match result {
                Ok(()) => {
                    store.apply(job_id, Transition::MarkCompensated { stage }).await?;
                    debug!(job_id = %job_id, stage = %stage, "Stage compensated");
                    report.compensated.push(stage);
                    self.services
                        .notify(Notification::new(NotificationKind::StageCompensated, job_id).with_stage(stage))
                        .await;
                }
                Err(err) => {
                    error!(job_id = %job_id, stage = %stage, error = %err, "Compensation failed");
                    report.failed.push((stage, err.message().to_string()));
                    self.services
                        .notify(
                            Notification::new(NotificationKind::CompensationFailed, job_id)
                                .with_stage(stage)
                                .with_detail(serde_json::json!({ "error": err.message() })),
                        )
                        .await;
                }
            }
        }

        let finished = store
            .apply(
                job_id,
                Transition::MarkFailed {
                    reason: reason.to_string(),
                },
            )
            .await?;
        if finished.is_applied() {
            info!(
                job_id = %job_id,
                compensated = ?report.compensated,
                failed = report.failed.len(),
                "Job failed"
            );
            self.services
                .notify(
                    Notification::new(NotificationKind::JobFailed, job_id)
                        .with_optional_stage(failed_stage)
                        .with_detail(serde_json::json!({
                            "reason": finished.job().error,
                            "compensated": report.compensated,
                        })),
                )
                .await;
        }
        Ok(report)
    }
}

#[async_trait]
impl DeadLetterObserver for SagaCoordinator {
    async fn on_dead_letter(&self, dead_letter: &DeadLetter) {
        if !dead_letter.event_type.advances_job() {
            return;
        }
        let Some(job_id) = dead_letter.job_id() else {
            return;
        };
        if let Err(err) = self
            .abort(job_id, dead_letter.stage(), &dead_letter.reason)
            .await
        {
            error!(job_id = %job_id, error = %err, "Could not fail job after dead letter");
        }
    }
}

impl std::fmt::Debug for SagaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<&Stage> = self.compensators.keys().collect();
        stages.sort();
        f.debug_struct("SagaCoordinator")
            .field("compensators", &stages)
            .field("compensation_timeout", &self.compensation_timeout)
            .finish_non_exhaustive()
    }
}
