//! Assembles the pipeline and runs its consumers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::broker::{Broker, InMemoryBroker};
use crate::cancellation::CancellationToken;
use crate::codec::{EventCodec, PayloadOffloader};
use crate::config::InferflowConfig;
use crate::dispatch::{Consumer, ConsumerStats, ConsumerStatsSnapshot, HandlerRegistry, Services};
use crate::errors::{InferflowError, Result};
use crate::lifecycle::{EventSink, LoggingEventSink};
use crate::pipeline::{register_pipeline_handlers, StageExecutor, StageExecutors};
use crate::retry::RetryPolicy;
use crate::saga::{Compensator, SagaCoordinator};
use crate::service::JobService;
use crate::storage::{InMemoryObjectStore, ObjectStore};
use crate::store::{InMemoryJobStore, JobStore};

/// Builder for [`Engine`].
///
/// Anything not supplied falls back to the in-memory implementation, and
/// notifications go to the log.
#[derive(Default)]
pub struct EngineBuilder {
    config: InferflowConfig,
    store: Option<Arc<dyn JobStore>>,
    broker: Option<Arc<dyn Broker>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    sink: Option<Arc<dyn EventSink>>,
    executors: Vec<Arc<dyn StageExecutor>>,
    compensators: Vec<Arc<dyn Compensator>>,
    compensation_timeout: Option<Duration>,
}

impl EngineBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: InferflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the job state store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the broker.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Sets where large payloads are stored.
    #[must_use]
    pub fn object_store(mut self, object_store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(object_store);
        self
    }

    /// Sets the notification sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Adds a stage executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Adds a compensator.
    #[must_use]
    pub fn compensator(mut self, compensator: Arc<dyn Compensator>) -> Self {
        self.compensators.push(compensator);
        self
    }

    /// Sets how long one compensator may run.
    #[must_use]
    pub fn compensation_timeout(mut self, timeout: Duration) -> Self {
        self.compensation_timeout = Some(timeout);
        self
    }

    /// Validates the configuration and wires everything together.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let codec = EventCodec::from_config(&self.config.codec);
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new(codec)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let object_store = self
            .object_store
            .unwrap_or_else(|| Arc::new(InMemoryObjectStore::new()));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LoggingEventSink::default()));
        let offloader = Arc::new(PayloadOffloader::new(
            object_store,
            self.config.codec.inline_limit_bytes,
        ));
        let services = Arc::new(Services::new(store, broker, offloader, sink));

        let mut executors = StageExecutors::new();
        for executor in self.executors {
            executors.register(executor)?;
        }
        let executors = Arc::new(executors);

        let mut saga = SagaCoordinator::new(services.clone());
        if let Some(timeout) = self.compensation_timeout {
            saga = saga.with_compensation_timeout(timeout);
        }
        for compensator in self.compensators {
            saga = saga.with_compensator(compensator);
        }
        let saga = Arc::new(saga);

        let mut registry = HandlerRegistry::new();
        register_pipeline_handlers(&mut registry, saga.clone(), executors.clone())?;

        Ok(Engine {
            retry: Arc::new(RetryPolicy::new(self.config.retry.clone())),
            permits: Arc::new(Semaphore::new(self.config.consumer.capacity)),
            config: self.config,
            codec,
            services,
            saga,
            executors,
            registry: Arc::new(registry),
        })
    }
}

/// A wired pipeline, ready to start.
pub struct Engine {
    config: InferflowConfig,
    codec: EventCodec,
    services: Arc<Services>,
    saga: Arc<SagaCoordinator>,
    executors: Arc<StageExecutors>,
    registry: Arc<HandlerRegistry>,
    retry: Arc<RetryPolicy>,
    permits: Arc<Semaphore>,
}

impl Engine {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &InferflowConfig {
        &self.config
    }

    /// Shared collaborators.
    #[must_use]
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// The saga coordinator.
    #[must_use]
    pub fn saga(&self) -> &Arc<SagaCoordinator> {
        &self.saga
    }

    /// The retry state machine shared by all consumers.
    #[must_use]
    pub fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry
    }

    /// The client-facing job API.
    #[must_use]
    pub fn job_service(&self) -> JobService {
        JobService::new(self.services.clone(), self.executors.clone())
    }

    /// Spawns the configured number of consumers.
    ///
    /// All consumers share one permit pool, one retry state machine and
    /// one shutdown token.
    pub fn start(&self) -> EngineHandle {
        let shutdown = Arc::new(CancellationToken::new());
        let grace = Duration::from_millis(self.config.consumer.shutdown_grace_ms);
        let mut tasks = JoinSet::new();
        let mut stats = Vec::with_capacity(self.config.consumer.workers);

        for worker in 0..self.config.consumer.workers {
            let consumer = Consumer::new(
                format!("{}-{worker}", self.config.consumer.name),
                self.registry.clone(),
                self.services.clone(),
                self.codec,
                self.retry.clone(),
                self.permits.clone(),
            )
            .with_dead_letter_observer(self.saga.clone())
            .with_shutdown_token(shutdown.clone())
            .with_shutdown_grace(grace);
            stats.push(consumer.stats());
            tasks.spawn(Arc::new(consumer).run());
        }

        info!(
            workers = self.config.consumer.workers,
            capacity = self.config.consumer.capacity,
            "Engine started"
        );
        EngineHandle {
            shutdown,
            tasks,
            stats,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("executors", &self.executors)
            .field("handlers", &self.registry.event_types())
            .finish_non_exhaustive()
    }
}

/// Running consumers. Dropping the handle aborts them.
pub struct EngineHandle {
    shutdown: Arc<CancellationToken>,
    tasks: JoinSet<Result<()>>,
    stats: Vec<Arc<ConsumerStats>>,
}

impl EngineHandle {
    /// Counters summed over all consumers.
    #[must_use]
    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats
            .iter()
            .map(|s| s.snapshot())
            .fold(ConsumerStatsSnapshot::default(), |acc, s| ConsumerStatsSnapshot {
                received: acc.received + s.received,
                succeeded: acc.succeeded + s.succeeded,
                retried: acc.retried + s.retried,
                dead_lettered: acc.dead_lettered + s.dead_lettered,
                skipped: acc.skipped + s.skipped,
            })
    }

    /// Stops taking deliveries and waits for the consumers to drain.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel("engine shutdown");
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined
                .map_err(|e| InferflowError::Internal(format!("consumer task failed: {e}")))
                .and_then(|result| result);
            if let Err(err) = outcome {
                warn!(error = %err, "Consumer stopped with an error");
                first_error.get_or_insert(err);
            }
        }
        info!("Engine stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("consumers", &self.tasks.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
