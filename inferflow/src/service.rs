//! Client-facing job API: submit, inspect, cancel.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{
    validate_pipeline, DeadLetter, Event, Job, JobCancelled, JobId, JobStatus, JobStatusView,
    JobSubmitted, Stage,
};
use crate::dispatch::Services;
use crate::errors::{InferflowError, Result};
use crate::pipeline::StageExecutors;
use crate::store::Transition;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Submits and tracks jobs.
#[derive(Debug, Clone)]
pub struct JobService {
    services: Arc<Services>,
    executors: Arc<StageExecutors>,
}

impl JobService {
    /// Creates the service.
    #[must_use]
    pub fn new(services: Arc<Services>, executors: Arc<StageExecutors>) -> Self {
        Self {
            services,
            executors,
        }
    }

    /// Submits a prompt to run through `stages`.
    ///
    /// The job record is created asynchronously by the `JobSubmitted`
    /// handler, so the job may not be visible until that event is consumed.
    pub async fn submit(&self, prompt: impl Into<String>, stages: Vec<Stage>) -> Result<JobId> {
        validate_pipeline(&stages)?;
        self.executors.ensure_supported(&stages)?;

        let job_id = JobId::new();
        let event = Event::from_body(
            job_id,
            &JobSubmitted {
                prompt: prompt.into(),
                stages,
            },
        )?;
        self.services.publish(event).await?;
        info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    /// Submits a prompt through retrieve, rerank and generate.
    pub async fn submit_default(&self, prompt: impl Into<String>) -> Result<JobId> {
        self.submit(prompt, Stage::ALL.to_vec()).await
    }

    /// Returns the job's stage and status.
    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        self.services.store.status(job_id).await
    }

    /// Returns the full job record.
    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.services.store.get(job_id).await
    }

    /// Returns every known job, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobStatusView>> {
        self.services.store.list().await
    }

    /// Returns a completed job's output, resolving offloaded payloads.
    ///
    /// `None` until the job has completed.
    pub async fn get_result(&self, job_id: JobId) -> Result<Option<serde_json::Value>> {
        let job = self.get_job(job_id).await?;
        match (job.status, job.pending_result) {
            (JobStatus::Completed, Some(result)) => {
                Ok(Some(self.services.resolve(&result.payload).await?))
            }
            _ => Ok(None),
        }
    }

    /// Requests cancellation.
    ///
    /// The in-flight stage, if any, runs to completion but its result is
    /// discarded. Returns false when the job had already finished or the
    /// request was already made.
    pub async fn cancel(&self, job_id: JobId, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        let job = self.get_job(job_id).await?;
        if job.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job already finished; not cancelling");
            return Ok(false);
        }

        let outcome = self
            .services
            .store
            .apply(
                job_id,
                Transition::RequestCancel {
                    reason: reason.clone(),
                },
            )
            .await?;
        if !outcome.is_applied() {
            return Ok(false);
        }

        self.services
            .publish(Event::from_body(job_id, &JobCancelled { reason })?)
            .await?;
        info!(job_id = %job_id, "Cancellation requested");
        Ok(true)
    }

    /// Everything routed to the dead-letter channel.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.services.broker.dead_letters().await
    }

    /// Polls until the job reaches a terminal status.
    ///
    /// A job not yet created is waited for as well.
    pub async fn wait_for_terminal(&self, job_id: JobId, timeout: Duration) -> Result<JobStatusView> {
        let poll = async {
            loop {
                match self.get_job_status(job_id).await {
                    Ok(view) if view.status.is_terminal() => return Ok(view),
                    Ok(_) | Err(InferflowError::JobNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            InferflowError::Timeout(format!("job {job_id} did not finish within {timeout:?}"))
        })?
    }
}
