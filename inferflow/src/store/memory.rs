//! In-memory job store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{apply_transition, CreateOutcome, JobStore, Transition, TransitionOutcome};
use crate::core::{Job, JobId, JobStatusView};
use crate::errors::{InferflowError, Result};

/// Job store backed by concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if no jobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of jobs with a live processing lock.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<CreateOutcome> {
        match self.jobs.entry(job.job_id) {
            Entry::Occupied(existing) => Ok(CreateOutcome::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                debug!(job_id = %job.job_id, stages = job.stages.len(), "Job created");
                slot.insert(job.clone());
                Ok(CreateOutcome::Created(job))
            }
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .get(&job_id)
            .map(|entry| entry.value().clone())
            .ok_or(InferflowError::JobNotFound(job_id))
    }

    async fn apply(&self, job_id: JobId, transition: Transition) -> Result<TransitionOutcome> {
        let mut entry = self
            .jobs
            .get_mut(&job_id)
            .ok_or(InferflowError::JobNotFound(job_id))?;

        let applied = apply_transition(entry.value_mut(), &transition)?;
        let job = entry.value().clone();

        if applied {
            debug!(
                job_id = %job_id,
                transition = transition.name(),
                status = %job.status,
                stage = ?job.current_stage,
                "Transition applied"
            );
            Ok(TransitionOutcome::Applied(job))
        } else {
            Ok(TransitionOutcome::AlreadyApplied(job))
        }
    }

    async fn lock(&self, job_id: JobId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        mutex.lock_owned().await
    }

    fn release_lock(&self, job_id: JobId) {
        let terminal = self
            .jobs
            .get(&job_id)
            .map_or(true, |job| job.is_terminal());
        if !terminal {
            return;
        }
        // The shard stays write-locked during the check, so no new holder
        // can clone the mutex in between.
        if self
            .locks
            .remove_if(&job_id, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some()
        {
            debug!(job_id = %job_id, "Job lock released");
        }
    }

    async fn list(&self) -> Result<Vec<JobStatusView>> {
        let mut jobs: Vec<(chrono::DateTime<chrono::Utc>, JobStatusView)> = self
            .jobs
            .iter()
            .map(|entry| (entry.created_at, entry.status_view()))
            .collect();
        jobs.sort_by_key(|(created_at, _)| *created_at);
        Ok(jobs.into_iter().map(|(_, view)| view).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobStatus, Payload, Stage, StageResult};
    use std::time::Duration;

    fn job() -> Job {
        Job::new(JobId::new(), "what is rust", Stage::ALL.to_vec())
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = job();

        assert!(store.create(job.clone()).await.unwrap().is_created());

        let mut duplicate = job.clone();
        duplicate.prompt = "different".to_string();
        let outcome = store.create(duplicate).await.unwrap();
        assert!(!outcome.is_created());
        assert_eq!(outcome.job().prompt, "what is rust");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let store = InMemoryJobStore::new();
        let err = store.get(JobId::new()).await.unwrap_err();
        assert!(matches!(err, InferflowError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_apply_and_status() {
        let store = InMemoryJobStore::new();
        let job = job();
        let job_id = job.job_id;
        store.create(job).await.unwrap();

        let outcome = store
            .apply(job_id, Transition::StartStage { stage: Stage::Retrieve })
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let status = store.status(job_id).await.unwrap();
        assert_eq!(status.stage, Some(Stage::Retrieve));
        assert_eq!(status.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_apply_rejected_leaves_job_untouched() {
        let store = InMemoryJobStore::new();
        let job = job();
        let job_id = job.job_id;
        store.create(job.clone()).await.unwrap();

        let err = store
            .apply(job_id, Transition::StartStage { stage: Stage::Generate })
            .await
            .unwrap_err();
        assert!(matches!(err, InferflowError::InvalidTransition(_)));
        assert_eq!(store.get(job_id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_duplicate_completion_reports_already_applied() {
        let store = InMemoryJobStore::new();
        let job = job();
        let job_id = job.job_id;
        store.create(job).await.unwrap();
        store
            .apply(job_id, Transition::StartStage { stage: Stage::Retrieve })
            .await
            .unwrap();

        let result = StageResult::new(job_id, Stage::Retrieve, Payload::empty());
        let first = store
            .apply(job_id, Transition::CompleteStage { result: result.clone() })
            .await
            .unwrap();
        let second = store
            .apply(job_id, Transition::CompleteStage { result })
            .await
            .unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(second.job().completed_stages, vec![Stage::Retrieve]);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = JobId::new();

        let guard = store.lock(job_id).await;
        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let _guard = store.lock(job_id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_locks_are_per_job() {
        let store = InMemoryJobStore::new();
        let _a = store.lock(JobId::new()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), store.lock(JobId::new())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_release_lock_only_for_idle_terminal_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = job();
        let job_id = job.job_id;
        store.create(job).await.unwrap();

        drop(store.lock(job_id).await);
        store.release_lock(job_id);
        assert_eq!(store.lock_count(), 1, "active job keeps its lock");

        for transition in [
            Transition::RequestCancel { reason: "stop".to_string() },
            Transition::Cancel { reason: "stop".to_string() },
        ] {
            store.apply(job_id, transition).await.unwrap();
        }
        let guard = store.lock(job_id).await;
        store.release_lock(job_id);
        assert_eq!(store.lock_count(), 1, "held lock is kept");

        drop(guard);
        store.release_lock(job_id);
        assert_eq!(store.lock_count(), 0);

        // A later event for the job gets a fresh lock.
        drop(store.lock(job_id).await);
        assert_eq!(store.lock_count(), 1);
    }

    #[tokio::test]
    async fn test_list_oldest_first() {
        let store = InMemoryJobStore::new();
        let first = job();
        let mut second = job();
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        store.create(second.clone()).await.unwrap();
        store.create(first.clone()).await.unwrap();

        let ids: Vec<JobId> = store.list().await.unwrap().into_iter().map(|v| v.job_id).collect();
        assert_eq!(ids, vec![first.job_id, second.job_id]);
    }
}
