//! Scripted executors and recording compensators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{JobId, Stage};
use crate::errors::HandlerError;
use crate::pipeline::StageExecutor;
use crate::saga::Compensator;

#[derive(Debug, Clone)]
enum Script {
    Succeed,
    FailTransient(u32),
    AlwaysFail(HandlerError),
}

/// An executor whose behavior is fixed up front.
///
/// By default it returns `{"stage": <stage>, "input": <input>}`.
#[derive(Debug)]
pub struct ScriptedExecutor {
    stage: Stage,
    script: Script,
    delay: Duration,
    output: Option<serde_json::Value>,
    calls: AtomicU32,
    jobs: Mutex<Vec<JobId>>,
}

impl ScriptedExecutor {
    fn with_script(stage: Stage, script: Script) -> Self {
        Self {
            stage,
            script,
            delay: Duration::ZERO,
            output: None,
            calls: AtomicU32::new(0),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds.
    #[must_use]
    pub fn succeeding(stage: Stage) -> Self {
        Self::with_script(stage, Script::Succeed)
    }

    /// Fails transiently `failures` times per executor, then succeeds.
    #[must_use]
    pub fn failing_transient(stage: Stage, failures: u32) -> Self {
        Self::with_script(stage, Script::FailTransient(failures))
    }

    /// Always fails with `error`.
    #[must_use]
    pub fn always_failing(stage: Stage, error: HandlerError) -> Self {
        Self::with_script(stage, Script::AlwaysFail(error))
    }

    /// Sleeps before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Returns `output` instead of echoing the input.
    #[must_use]
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Job of every call, in call order.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobId> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, job_id: JobId, input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.jobs.lock().push(job_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.script {
            Script::AlwaysFail(error) => return Err(error.clone()),
            Script::FailTransient(failures) if call <= *failures => {
                return Err(HandlerError::transient(format!(
                    "{} unavailable (call {call})",
                    self.stage
                )));
            }
            _ => {}
        }

        Ok(self.output.clone().unwrap_or_else(|| {
            serde_json::json!({ "stage": self.stage, "input": input })
        }))
    }
}

/// Shared, ordered record of compensations across compensators.
pub type CompensationLog = Arc<Mutex<Vec<(JobId, Stage)>>>;

/// Creates an empty [`CompensationLog`].
#[must_use]
pub fn compensation_log() -> CompensationLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A compensator that appends to a shared log.
#[derive(Debug)]
pub struct RecordingCompensator {
    stage: Stage,
    log: CompensationLog,
    error: Option<HandlerError>,
}

impl RecordingCompensator {
    /// Records and succeeds.
    #[must_use]
    pub fn new(stage: Stage, log: CompensationLog) -> Self {
        Self {
            stage,
            log,
            error: None,
        }
    }

    /// Records and then fails with `error`.
    #[must_use]
    pub fn failing(stage: Stage, log: CompensationLog, error: HandlerError) -> Self {
        Self {
            stage,
            log,
            error: Some(error),
        }
    }
}

#[async_trait]
impl Compensator for RecordingCompensator {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn compensate(&self, job_id: JobId, stage: Stage) -> Result<(), HandlerError> {
        self.log.lock().push((job_id, stage));
        self.error.clone().map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_transient_then_succeeds() {
        let executor = ScriptedExecutor::failing_transient(Stage::Retrieve, 2);
        let job_id = JobId::new();

        for _ in 0..2 {
            let err = executor.execute(job_id, serde_json::json!({})).await.unwrap_err();
            assert!(err.is_retryable());
        }
        let output = executor.execute(job_id, serde_json::json!({"q": 1})).await.unwrap();
        assert_eq!(output["input"]["q"], 1);
        assert_eq!(executor.calls(), 3);
        assert_eq!(executor.jobs(), vec![job_id; 3]);
    }

    #[tokio::test]
    async fn test_recording_compensator() {
        let log = compensation_log();
        let ok = RecordingCompensator::new(Stage::Retrieve, log.clone());
        let bad = RecordingCompensator::failing(Stage::Rerank, log.clone(), HandlerError::permanent("stuck"));
        let job_id = JobId::new();

        assert!(bad.compensate(job_id, Stage::Rerank).await.is_err());
        assert!(ok.compensate(job_id, Stage::Retrieve).await.is_ok());
        assert_eq!(
            *log.lock(),
            vec![(job_id, Stage::Rerank), (job_id, Stage::Retrieve)]
        );
    }
}
