//! An engine wired to inspectable in-memory components.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::InMemoryBroker;
use crate::codec::EventCodec;
use crate::config::InferflowConfig;
use crate::core::{JobId, JobStatusView, Stage};
use crate::engine::{Engine, EngineHandle};
use crate::errors::Result;
use crate::lifecycle::CollectingEventSink;
use crate::pipeline::StageExecutor;
use crate::retry::{JitterStrategy, RetryConfig};
use crate::saga::Compensator;
use crate::service::JobService;
use crate::storage::InMemoryObjectStore;
use crate::store::InMemoryJobStore;

use super::ScriptedExecutor;

/// Configuration with millisecond retry delays and no jitter.
#[must_use]
pub fn fast_config() -> InferflowConfig {
    InferflowConfig::new()
        .with_retry(
            RetryConfig::new()
                .with_base_delay_ms(1)
                .with_max_delay_ms(5)
                .with_jitter(JitterStrategy::None),
        )
        .with_shutdown_grace_ms(500)
}

/// Collects executors and compensators for a [`TestHarness`].
#[derive(Default)]
pub struct TestHarnessBuilder {
    config: Option<InferflowConfig>,
    executors: Vec<Arc<dyn StageExecutor>>,
    compensators: Vec<Arc<dyn Compensator>>,
}

impl TestHarnessBuilder {
    /// Overrides [`fast_config`].
    #[must_use]
    pub fn config(mut self, config: InferflowConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Adds an executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Adds a succeeding executor for every stage without one.
    #[must_use]
    pub fn fill_succeeding(mut self) -> Self {
        for stage in Stage::ALL {
            if !self.executors.iter().any(|e| e.stage() == stage) {
                self.executors
                    .push(Arc::new(ScriptedExecutor::succeeding(stage)));
            }
        }
        self
    }

    /// Adds a compensator.
    #[must_use]
    pub fn compensator(mut self, compensator: Arc<dyn Compensator>) -> Self {
        self.compensators.push(compensator);
        self
    }

    /// Builds the harness without starting consumers.
    pub fn build(self) -> Result<TestHarness> {
        let config = self.config.unwrap_or_else(fast_config);
        let broker = Arc::new(InMemoryBroker::new(EventCodec::from_config(&config.codec)));
        let store = Arc::new(InMemoryJobStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let sink = Arc::new(CollectingEventSink::new());

        let mut builder = Engine::builder()
            .config(config)
            .broker(broker.clone())
            .store(store.clone())
            .object_store(objects.clone())
            .sink(sink.clone())
            .compensation_timeout(Duration::from_secs(1));
        for executor in self.executors {
            builder = builder.executor(executor);
        }
        for compensator in self.compensators {
            builder = builder.compensator(compensator);
        }
        let engine = builder.build()?;

        Ok(TestHarness {
            jobs: engine.job_service(),
            engine,
            broker,
            store,
            objects,
            sink,
        })
    }
}

/// In-memory engine with handles on every component.
pub struct TestHarness {
    /// The engine.
    pub engine: Engine,
    /// Job API.
    pub jobs: JobService,
    /// The broker.
    pub broker: Arc<InMemoryBroker>,
    /// The job store.
    pub store: Arc<InMemoryJobStore>,
    /// Offloaded payloads.
    pub objects: Arc<InMemoryObjectStore>,
    /// Every notification emitted.
    pub sink: Arc<CollectingEventSink>,
}

impl TestHarness {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// Starts the engine's consumers.
    pub fn start(&self) -> EngineHandle {
        self.engine.start()
    }

    /// Waits up to five seconds for the job to finish.
    pub async fn wait(&self, job_id: JobId) -> Result<JobStatusView> {
        self.jobs
            .wait_for_terminal(job_id, Duration::from_secs(5))
            .await
    }
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
