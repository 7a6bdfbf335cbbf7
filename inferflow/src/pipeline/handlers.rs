//! Event handlers for each event type.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::StageExecutors;
use crate::core::{
    validate_pipeline, Event, EventType, Job, JobCancelled, JobFailed, JobStatus, JobSubmitted,
    Payload, Stage, StageResult,
};
use crate::dispatch::{EventHandler, HandlerContext, HandlerRegistry};
use crate::errors::{HandlerError, Result};
use crate::lifecycle::{Notification, NotificationKind};
use crate::saga::{NextStep, SagaCoordinator};
use crate::store::Transition;

/// Registers a handler for every event type.
pub fn register_pipeline_handlers(
    registry: &mut HandlerRegistry,
    saga: Arc<SagaCoordinator>,
    executors: Arc<StageExecutors>,
) -> Result<()> {
    registry.register(Arc::new(JobSubmittedHandler))?;
    registry.register(Arc::new(StageHandler::stage_ready(executors.clone())))?;
    registry.register(Arc::new(StageHandler::prompt_ready(executors)))?;
    registry.register(Arc::new(InferenceCompletedHandler))?;
    registry.register(Arc::new(JobFailedHandler::new(saga)))?;
    registry.register(Arc::new(JobCancelledHandler))?;
    Ok(())
}

/// Creates the job record and publishes its first stage.
#[derive(Debug, Default)]
pub struct JobSubmittedHandler;

#[async_trait]
impl EventHandler for JobSubmittedHandler {
    fn event_type(&self) -> EventType {
        EventType::JobSubmitted
    }

    async fn handle(&self, ctx: &HandlerContext, event: &Event) -> Result<(), HandlerError> {
        let body: JobSubmitted = ctx.body(event).await?;
        validate_pipeline(&body.stages)?;

        let outcome = ctx
            .store()
            .create(Job::new(event.job_id, body.prompt, body.stages))
            .await?;
        if outcome.is_created() {
            info!(job_id = %event.job_id, stages = ?outcome.job().stages, "Job accepted");
            ctx.notify(Notification::new(NotificationKind::JobCreated, event.job_id))
                .await;
        }

        // A redelivered submission republishes the trigger only while the
        // first stage has not started.
        let job = outcome.job();
        if job.status == JobStatus::Pending && !job.cancel_requested {
            if let Some(trigger) = SagaCoordinator::first_trigger(job) {
                ctx.publish(trigger).await?;
            }
        }
        Ok(())
    }
}

/// Runs one stage: `StageReady` for retrieve and rerank, `PromptReady` for
/// generate.
pub struct StageHandler {
    event_type: EventType,
    executors: Arc<StageExecutors>,
}

impl StageHandler {
    /// Handler for non-inference stages.
    #[must_use]
    pub fn stage_ready(executors: Arc<StageExecutors>) -> Self {
        Self {
            event_type: EventType::StageReady,
            executors,
        }
    }

    /// Handler for the inference stage.
    #[must_use]
    pub fn prompt_ready(executors: Arc<StageExecutors>) -> Self {
        Self {
            event_type: EventType::PromptReady,
            executors,
        }
    }

    fn stage_of(&self, event: &Event) -> Result<Stage, HandlerError> {
        let stage = event
            .stage
            .ok_or_else(|| HandlerError::permanent(format!("{} event has no stage", event.event_type)))?;
        let expects_inference = self.event_type == EventType::PromptReady;
        if stage.is_inference() != expects_inference {
            return Err(HandlerError::permanent(format!(
                "stage '{stage}' cannot run from a {} event",
                self.event_type
            )));
        }
        Ok(stage)
    }

    /// Publishes whatever follows `stage`.
    async fn advance(&self, ctx: &HandlerContext, job: &Job, stage: Stage, payload: Payload) -> Result<(), HandlerError> {
        let next = match SagaCoordinator::next_step(job, stage) {
            NextStep::Run(next) => SagaCoordinator::trigger_event(job.job_id, next, payload),
            NextStep::Finish => Event::stage_data(EventType::InferenceCompleted, job.job_id, stage, payload),
        };
        ctx.publish(next).await?;
        Ok(())
    }
}

impl std::fmt::Debug for StageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandler")
            .field("event_type", &self.event_type)
            .field("executors", &self.executors)
            .finish()
    }
}

#[async_trait]
impl EventHandler for StageHandler {
    fn event_type(&self) -> EventType {
        self.event_type
    }

    async fn handle(&self, ctx: &HandlerContext, event: &Event) -> Result<(), HandlerError> {
        let stage = self.stage_of(event)?;
        let job_id = event.job_id;
        let store = ctx.store();
        let job = store.get(job_id).await?;

        if job.is_terminal() || job.status == JobStatus::Compensating {
            debug!(status = %job.status, "Job is finishing; skipping stage");
            return Ok(());
        }

        if job.is_stage_completed(stage) {
            // The result was stored but the next step may never have been
            // published. Republish it if nothing later has started.
            let latest = job
                .pending_result
                .as_ref()
                .filter(|r| r.stage == stage && job.current_stage == Some(stage));
            if let Some(result) = latest {
                debug!("Stage already completed; republishing next step");
                self.advance(ctx, &job, stage, result.payload.clone()).await?;
            }
            return Ok(());
        }

        if job.cancel_requested {
            debug!("Cancellation requested; not starting stage");
            return Ok(());
        }

        let executor = self
            .executors
            .get(stage)
            .ok_or_else(|| HandlerError::permanent(format!("no executor for stage '{stage}'")))?;

        if store.apply(job_id, Transition::StartStage { stage }).await?.is_applied() {
            ctx.notify(Notification::new(NotificationKind::StageStarted, job_id).with_stage(stage))
                .await;
        }
        store.apply(job_id, Transition::RecordAttempt { stage }).await?;

        let input = ctx.resolve(&event.payload).await?;
        let output = executor.execute(job_id, input).await?;

        // The job may have been cancelled while the stage ran.
        let job = store.get(job_id).await?;
        if job.cancel_requested || job.is_terminal() {
            info!(status = %job.status, "Job cancelled mid-stage; discarding result");
            ctx.notify(Notification::new(NotificationKind::ResultDiscarded, job_id).with_stage(stage))
                .await;
            return Ok(());
        }

        let payload = ctx
            .services()
            .offloader
            .externalize(Payload::inline(output))
            .await?;
        let completed = store
            .apply(
                job_id,
                Transition::CompleteStage {
                    result: StageResult::new(job_id, stage, payload.clone()),
                },
            )
            .await?;
        ctx.notify(
            Notification::new(NotificationKind::StageCompleted, job_id)
                .with_stage(stage)
                .with_detail(serde_json::json!({
                    "attempt": ctx.attempt(),
                    "offloaded": payload.is_reference(),
                })),
        )
        .await;

        self.advance(ctx, completed.job(), stage, payload).await
    }
}

/// Marks a job completed once inference output exists.
#[derive(Debug, Default)]
pub struct InferenceCompletedHandler;

#[async_trait]
impl EventHandler for InferenceCompletedHandler {
    fn event_type(&self) -> EventType {
        EventType::InferenceCompleted
    }

    async fn handle(&self, ctx: &HandlerContext, event: &Event) -> Result<(), HandlerError> {
        let job = ctx.store().get(event.job_id).await?;
        if job.is_terminal() || job.cancel_requested || job.status == JobStatus::Compensating {
            debug!(status = %job.status, "Not completing job");
            return Ok(());
        }

        let outcome = ctx.store().apply(event.job_id, Transition::Complete).await?;
        if outcome.is_applied() {
            info!(job_id = %event.job_id, "Job completed");
            ctx.notify(
                Notification::new(NotificationKind::JobCompleted, event.job_id)
                    .with_optional_stage(event.stage)
                    .with_detail(serde_json::json!({
                        "stages": outcome.job().completed_stages,
                    })),
            )
            .await;
        }
        Ok(())
    }
}

/// Compensates and fails a job.
#[derive(Debug)]
pub struct JobFailedHandler {
    saga: Arc<SagaCoordinator>,
}

impl JobFailedHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(saga: Arc<SagaCoordinator>) -> Self {
        Self { saga }
    }
}

#[async_trait]
impl EventHandler for JobFailedHandler {
    fn event_type(&self) -> EventType {
        EventType::JobFailed
    }

    async fn handle(&self, ctx: &HandlerContext, event: &Event) -> Result<(), HandlerError> {
        let body: JobFailed = ctx.body(event).await?;
        let job = ctx.store().get(event.job_id).await?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
            debug!(status = %job.status, "Job already finished; ignoring failure");
            return Ok(());
        }

        let report = self
            .saga
            .compensate(event.job_id, body.stage, &body.reason)
            .await?;
        debug!(?report, "Compensation finished");
        Ok(())
    }
}

/// Finishes a job whose cancellation was requested.
#[derive(Debug, Default)]
pub struct JobCancelledHandler;

#[async_trait]
impl EventHandler for JobCancelledHandler {
    fn event_type(&self) -> EventType {
        EventType::JobCancelled
    }

    async fn handle(&self, ctx: &HandlerContext, event: &Event) -> Result<(), HandlerError> {
        let body: JobCancelled = ctx.body(event).await?;
        let store = ctx.store();
        let job = store.get(event.job_id).await?;
        if job.is_terminal() || job.status == JobStatus::Compensating {
            debug!(status = %job.status, "Job is finishing; ignoring cancellation");
            return Ok(());
        }

        store
            .apply(
                event.job_id,
                Transition::RequestCancel {
                    reason: body.reason.clone(),
                },
            )
            .await?;
        let outcome = store
            .apply(
                event.job_id,
                Transition::Cancel {
                    reason: body.reason.clone(),
                },
            )
            .await?;

        if outcome.is_applied() {
            info!(job_id = %event.job_id, reason = %body.reason, "Job cancelled");
            ctx.notify(
                Notification::new(NotificationKind::JobCancelled, event.job_id)
                    .with_optional_stage(outcome.job().current_stage)
                    .with_detail(serde_json::json!({ "reason": body.reason })),
            )
            .await;
        }
        Ok(())
    }
}
