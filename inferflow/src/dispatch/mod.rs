//! Event dispatch.
//!
//! Each event type is routed to exactly one [`EventHandler`] through a
//! [`HandlerRegistry`]. The [`Consumer`] pulls deliveries from the broker,
//! invokes handlers under the retry policy and acknowledges deliveries
//! once they are handled or dead-lettered.

mod consumer;

pub use consumer::{Consumer, ConsumerStats, ConsumerStatsSnapshot};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::Broker;
use crate::codec::PayloadOffloader;
use crate::core::{DeadLetter, Event, EventBody, EventType, Payload};
use crate::errors::{HandlerError, InferflowError, Result};
use crate::lifecycle::{EventSink, Notification};
use crate::store::JobStore;

/// Shared collaborators available to every handler.
pub struct Services {
    /// Job state store.
    pub store: Arc<dyn JobStore>,
    /// Message broker.
    pub broker: Arc<dyn Broker>,
    /// Large payload offloader.
    pub offloader: Arc<PayloadOffloader>,
    /// Lifecycle notification sink.
    pub sink: Arc<dyn EventSink>,
}

impl Services {
    /// Bundles the collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        offloader: Arc<PayloadOffloader>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            broker,
            offloader,
            sink,
        }
    }

    /// Publishes an event, moving an oversize payload to object storage
    /// first.
    pub async fn publish(&self, mut event: Event) -> Result<()> {
        event.payload = self.offloader.externalize(event.payload).await?;
        self.broker.publish(&event).await
    }

    /// Resolves a payload to its value.
    pub async fn resolve(&self, payload: &Payload) -> Result<serde_json::Value> {
        self.offloader.resolve(payload).await
    }

    /// Emits a lifecycle notification.
    pub async fn notify(&self, notification: Notification) {
        self.sink.emit(notification).await;
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("offloader", &self.offloader)
            .finish_non_exhaustive()
    }
}

/// Context passed to a handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    services: Arc<Services>,
    attempt: u32,
}

impl HandlerContext {
    /// Creates a context for attempt number `attempt`.
    #[must_use]
    pub fn new(services: Arc<Services>, attempt: u32) -> Self {
        Self { services, attempt }
    }

    /// The 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The shared collaborators.
    #[must_use]
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// The job store.
    #[must_use]
    pub fn store(&self) -> &dyn JobStore {
        self.services.store.as_ref()
    }

    /// Publishes an event.
    pub async fn publish(&self, event: Event) -> Result<()> {
        self.services.publish(event).await
    }

    /// Resolves a payload to its value.
    pub async fn resolve(&self, payload: &Payload) -> Result<serde_json::Value> {
        self.services.resolve(payload).await
    }

    /// Resolves and decodes an event's typed body.
    pub async fn body<B: EventBody>(&self, event: &Event) -> Result<B> {
        let data = self.resolve(&event.payload).await?;
        event.decode_body(data)
    }

    /// Emits a lifecycle notification.
    pub async fn notify(&self, notification: Notification) {
        self.services.notify(notification).await;
    }
}

/// Handles one event type.
///
/// Handlers must be idempotent: the same event may be delivered more than
/// once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The event type this handler consumes.
    fn event_type(&self) -> EventType;

    /// Handles one event.
    async fn handle(&self, ctx: &HandlerContext, event: &Event) -> Result<(), HandlerError>;
}

/// Reacts to events routed to the dead-letter channel.
#[async_trait]
pub trait DeadLetterObserver: Send + Sync {
    /// Called after a dead letter was published.
    async fn on_dead_letter(&self, dead_letter: &DeadLetter);
}

/// Maps event types to their single handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Fails if its event type already has one.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let event_type = handler.event_type();
        if self.handlers.contains_key(&event_type) {
            return Err(InferflowError::DuplicateHandler(event_type));
        }
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    /// Registers a handler, builder style.
    pub fn with(mut self, handler: Arc<dyn EventHandler>) -> Result<Self> {
        self.register(handler)?;
        Ok(self)
    }

    /// Returns the handler for an event type.
    #[must_use]
    pub fn get(&self, event_type: EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&event_type).cloned()
    }

    /// Event types with a handler, in declaration order.
    #[must_use]
    pub fn event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(EventType);

    #[async_trait]
    impl EventHandler for Noop {
        fn event_type(&self) -> EventType {
            self.0
        }

        async fn handle(&self, _ctx: &HandlerContext, _event: &Event) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_routes_by_type() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Noop(EventType::PromptReady)))
            .unwrap()
            .with(Arc::new(Noop(EventType::JobSubmitted)))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get(EventType::PromptReady).is_some());
        assert!(registry.get(EventType::JobFailed).is_none());
        assert_eq!(
            registry.event_types(),
            vec![EventType::JobSubmitted, EventType::PromptReady]
        );
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Noop(EventType::JobFailed))).unwrap();

        let err = registry
            .register(Arc::new(Noop(EventType::JobFailed)))
            .unwrap_err();
        assert!(matches!(err, InferflowError::DuplicateHandler(EventType::JobFailed)));
        assert_eq!(registry.len(), 1);
    }
}
