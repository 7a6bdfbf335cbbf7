//! Job state store.
//!
//! The store is the source of truth for job status. Every change goes
//! through [`JobStore::apply`], which enforces forward-only stage
//! progression and reports redundant transitions as
//! [`TransitionOutcome::AlreadyApplied`] so that at-least-once delivery
//! never applies an effect twice.

mod memory;
mod transition;

pub use memory::InMemoryJobStore;
pub use transition::{apply_transition, Transition, TransitionOutcome};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::core::{Job, JobId, JobStatusView};
use crate::errors::Result;

/// Result of creating a job.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The job was new.
    Created(Job),
    /// A job with this id already existed; it is returned unchanged.
    Existing(Job),
}

impl CreateOutcome {
    /// Returns true if the job was new.
    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The stored job.
    #[must_use]
    pub fn job(&self) -> &Job {
        match self {
            Self::Created(job) | Self::Existing(job) => job,
        }
    }
}

/// Persistent job state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a job unless one with the same id exists.
    async fn create(&self, job: Job) -> Result<CreateOutcome>;

    /// Fetches a job.
    async fn get(&self, job_id: JobId) -> Result<Job>;

    /// Applies a transition atomically.
    async fn apply(&self, job_id: JobId, transition: Transition) -> Result<TransitionOutcome>;

    /// Acquires the job's processing lock. Handlers for the same job hold
    /// it so that they never interleave.
    async fn lock(&self, job_id: JobId) -> OwnedMutexGuard<()>;

    /// Forgets the job's lock once the job is terminal and no one holds or
    /// waits on it.
    fn release_lock(&self, _job_id: JobId) {}

    /// Lists all jobs, oldest first.
    async fn list(&self) -> Result<Vec<JobStatusView>>;

    /// Returns the externally visible status of a job.
    async fn status(&self, job_id: JobId) -> Result<JobStatusView> {
        Ok(self.get(job_id).await?.status_view())
    }
}
