//! The dispatch/consumer loop.

use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{DeadLetterObserver, EventHandler, HandlerContext, HandlerRegistry, Services};
use crate::broker::Delivery;
use crate::cancellation::CancellationToken;
use crate::codec::EventCodec;
use crate::core::{DeadLetter, Event};
use crate::errors::{ErrorKind, InferflowError, Result};
use crate::lifecycle::{Notification, NotificationKind};
use crate::observability::SpanTimer;
use crate::retry::{RetryDecision, RetryPolicy};

/// Counters for one consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    /// Deliveries taken from the broker.
    pub received: u64,
    /// Events handled successfully.
    pub succeeded: u64,
    /// Failed attempts that were retried.
    pub retried: u64,
    /// Deliveries routed to the dead-letter channel.
    pub dead_lettered: u64,
    /// Redeliveries dropped because their step was already dead-lettered.
    pub skipped: u64,
}

impl ConsumerStats {
    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Pulls deliveries from every registered channel and dispatches them.
///
/// In-flight handler invocations are bounded by a semaphore that may be
/// shared between consumers; a delivery is only taken from the broker once
/// a permit is free. Invocations for the same job never interleave.
pub struct Consumer {
    name: String,
    registry: Arc<HandlerRegistry>,
    services: Arc<Services>,
    codec: EventCodec,
    retry: Arc<RetryPolicy>,
    permits: Arc<Semaphore>,
    observer: Option<Arc<dyn DeadLetterObserver>>,
    shutdown: Arc<CancellationToken>,
    shutdown_grace: Duration,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        services: Arc<Services>,
        codec: EventCodec,
        retry: Arc<RetryPolicy>,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            services,
            codec,
            retry,
            permits,
            observer: None,
            shutdown: Arc::new(CancellationToken::new()),
            shutdown_grace: Duration::from_secs(5),
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Sets the observer told about dead letters.
    #[must_use]
    pub fn with_dead_letter_observer(mut self, observer: Arc<dyn DeadLetterObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets the shutdown token.
    #[must_use]
    pub fn with_shutdown_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.shutdown = token;
        self
    }

    /// Sets how long shutdown waits for in-flight handlers.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// The consumer's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The consumer's counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Runs until the shutdown token is cancelled or every channel closes.
    ///
    /// On shutdown no new deliveries are taken; in-flight handlers get the
    /// grace period to finish and are aborted after it. Aborted deliveries
    /// stay unacknowledged for the broker to hand out again.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let event_types = self.registry.event_types();
        let mut subscriptions = Vec::with_capacity(event_types.len());
        for event_type in &event_types {
            subscriptions.push(self.services.broker.subscribe(*event_type).await?);
        }
        let mut deliveries = futures::stream::select_all(subscriptions);
        let mut in_flight = JoinSet::new();

        info!(consumer = %self.name, channels = event_types.len(), "Consumer started");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                self.log_join(joined);
            }

            // Take the delivery before the permit. A worker parked on the
            // semaphore must not hold capacity another worker's queue needs.
            let delivery = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        info!(consumer = %self.name, "All channels closed");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!(consumer = %self.name, "Shutdown while waiting for capacity");
                    break;
                }
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|_| InferflowError::Internal("consumer semaphore closed".to_string()))?,
            };

            let this = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                this.process(delivery).await;
            });
        }

        self.drain(in_flight).await;
        info!(consumer = %self.name, stats = ?self.stats.snapshot(), "Consumer stopped");
        Ok(())
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        info!(
            consumer = %self.name,
            in_flight = in_flight.len(),
            grace_ms = self.shutdown_grace.as_millis() as u64,
            "Waiting for in-flight handlers"
        );

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                self.log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                consumer = %self.name,
                aborted = in_flight.len(),
                "Grace period elapsed; aborting in-flight handlers"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }

    fn log_join(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(consumer = %self.name, error = %err, "Handler task panicked");
            }
        }
    }

    /// Decodes, dispatches and acknowledges one delivery.
    pub async fn process(&self, delivery: Delivery) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let event = match self.codec.decode(&delivery.bytes) {
            Ok(event) => event,
            Err(err) => {
                self.reject_undecodable(&delivery, &err).await;
                return;
            }
        };

        let Some(handler) = self.registry.get(event.event_type) else {
            let reason = format!("no handler registered for {}", event.event_type);
            error!(job_id = %event.job_id, event_type = %event.event_type, "{reason}");
            let dead = DeadLetter::for_event(event, reason, ErrorKind::Permanent, 0);
            self.dead_letter(&delivery, dead).await;
            return;
        };

        let span = info_span!(
            "handle_event",
            consumer = %self.name,
            job_id = %event.job_id,
            event_type = %event.event_type,
            stage = ?event.stage,
            redelivered = delivery.redelivered,
        );
        self.dispatch(handler, &delivery, event).instrument(span).await;
    }

    async fn dispatch(&self, handler: Arc<dyn EventHandler>, delivery: &Delivery, event: Event) {
        let job_id = event.job_id;
        {
            let _job_guard = self.services.store.lock(job_id).await;
            self.attempt_until_settled(handler, delivery, event).await;
        }
        self.services.store.release_lock(job_id);
    }

    /// Runs the handler until it succeeds, the step is dead-lettered or
    /// shutdown interrupts a backoff.
    async fn attempt_until_settled(&self, handler: Arc<dyn EventHandler>, delivery: &Delivery, event: Event) {
        let step = event.step_key();

        loop {
            let Some(attempt) = self.retry.begin_attempt(event.job_id, step) else {
                debug!("Step already dead-lettered; dropping redelivery");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.ack(delivery).await;
                return;
            };

            let ctx = HandlerContext::new(self.services.clone(), attempt);
            let timer = SpanTimer::start(event.event_type.as_str());
            let outcome = handler.handle(&ctx, &event).await;
            let elapsed_ms = timer.finish();

            let err = match outcome {
                Ok(()) => {
                    self.retry.on_success(event.job_id, step);
                    if event.event_type.closes_job() {
                        self.retry.forget_job(event.job_id);
                    }
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, elapsed_ms, "Event handled");
                    self.ack(delivery).await;
                    return;
                }
                Err(err) => err,
            };

            match self.retry.on_failure(event.job_id, step, &err) {
                RetryDecision::Retry {
                    attempt: next_attempt,
                    delay,
                } => {
                    let delay_ms = delay.as_millis() as u64;
                    warn!(attempt, next_attempt, delay_ms, error = %err, "Handler failed; retrying");
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    self.services
                        .notify(
                            Notification::new(NotificationKind::RetryScheduled, event.job_id)
                                .with_optional_stage(event.stage)
                                .with_detail(serde_json::json!({
                                    "attempt": next_attempt,
                                    "delay_ms": delay_ms,
                                    "error": err.message(),
                                })),
                        )
                        .await;

                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => {
                            info!("Shutdown during backoff; leaving delivery unacknowledged");
                            return;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DeadLetter {
                    attempts,
                    reason,
                    kind,
                } => {
                    error!(attempts, error_kind = %kind, error = %reason, "Handler failed; dead-lettering");
                    let dead = DeadLetter::for_event(event, reason, kind, attempts);
                    self.dead_letter(delivery, dead).await;
                    return;
                }
                RetryDecision::AlreadyDeadLettered => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    self.ack(delivery).await;
                    return;
                }
            }
        }
    }

    async fn reject_undecodable(&self, delivery: &Delivery, err: &InferflowError) {
        let kind = err.kind();
        error!(
            consumer = %self.name,
            event_type = %delivery.event_type,
            delivery_id = delivery.delivery_id,
            error_kind = %kind,
            error = %err,
            "Undecodable delivery"
        );
        let dead = DeadLetter::undecodable(delivery.event_type, delivery.bytes.clone(), err.to_string(), kind);
        self.dead_letter(delivery, dead).await;
    }

    async fn dead_letter(&self, delivery: &Delivery, dead: DeadLetter) {
        if let Err(err) = self.services.broker.publish_dead_letter(dead.clone()).await {
            error!(error = %err, "Dead letter could not be published; leaving delivery unacknowledged");
            return;
        }
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);

        if let Some(job_id) = dead.job_id() {
            self.services
                .notify(
                    Notification::new(NotificationKind::DeadLettered, job_id)
                        .with_optional_stage(dead.stage())
                        .with_detail(serde_json::json!({
                            "event_type": dead.event_type,
                            "error_kind": dead.error_kind,
                            "attempts": dead.attempts,
                            "reason": dead.reason,
                        })),
                )
                .await;
        }

        if let Some(observer) = &self.observer {
            observer.on_dead_letter(&dead).await;
        }
        self.ack(delivery).await;
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(err) = self.services.broker.ack(delivery).await {
            warn!(delivery_id = delivery.delivery_id, error = %err, "Acknowledgement failed");
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}
