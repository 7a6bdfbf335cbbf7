//! The retrieve → rerank → generate pipeline.
//!
//! Stage work is done by [`StageExecutor`]s; the handlers in this module
//! wrap them with job state bookkeeping, cancellation checks and next-step
//! publication.

mod handlers;

#[cfg(test)]
mod integration_tests;

pub use handlers::{
    register_pipeline_handlers, InferenceCompletedHandler, JobCancelledHandler,
    JobFailedHandler, JobSubmittedHandler, StageHandler,
};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{JobId, Stage};
use crate::errors::{HandlerError, InferflowError, Result};

/// Does the work of one stage.
///
/// Executors receive the previous stage's output (or `{"prompt": ...}` for
/// the first stage) and return this stage's output. A returned
/// [`HandlerError`] decides whether the attempt is retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// The stage this executor runs.
    fn stage(&self) -> Stage;

    /// Runs the stage for a job.
    async fn execute(&self, job_id: JobId, input: serde_json::Value) -> Result<serde_json::Value, HandlerError>;
}

/// One executor per stage.
#[derive(Clone, Default)]
pub struct StageExecutors {
    executors: BTreeMap<Stage, Arc<dyn StageExecutor>>,
}

impl StageExecutors {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an executor. Fails if its stage already has one.
    pub fn register(&mut self, executor: Arc<dyn StageExecutor>) -> Result<()> {
        let stage = executor.stage();
        if self.executors.contains_key(&stage) {
            return Err(InferflowError::InvalidPipeline(format!(
                "executor for stage '{stage}' registered twice"
            )));
        }
        self.executors.insert(stage, executor);
        Ok(())
    }

    /// Returns the executor for a stage.
    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    /// Stages with an executor, in pipeline order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.executors.keys().copied().collect()
    }

    /// Checks that every stage in `stages` has an executor.
    pub fn ensure_supported(&self, stages: &[Stage]) -> Result<()> {
        match stages.iter().find(|s| !self.executors.contains_key(s)) {
            Some(missing) => Err(InferflowError::InvalidPipeline(format!(
                "no executor for stage '{missing}'"
            ))),
            None => Ok(()),
        }
    }

    /// Number of executors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Returns true if there are no executors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for StageExecutors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutors")
            .field("stages", &self.stages())
            .finish()
    }
}
