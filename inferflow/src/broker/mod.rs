//! Broker channel contract.
//!
//! One channel per event type. Delivery is at-least-once: a delivery stays
//! outstanding until it is acknowledged and may be handed out again, so
//! consumers must be idempotent.

mod memory;

pub use memory::{BrokerStats, InMemoryBroker};

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::core::{DeadLetter, Event, EventType};
use crate::errors::Result;

/// One delivery of an encoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id used for acknowledgement.
    pub delivery_id: u64,
    /// The channel the delivery came from.
    pub event_type: EventType,
    /// Encoded event.
    pub bytes: Vec<u8>,
    /// True if this delivery was handed out before.
    pub redelivered: bool,
}

/// A stream of messages from a broker channel.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wraps a receiver.
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Waits for the next message. Returns `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns the next message if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Message broker with one channel per event type and a dead-letter
/// channel.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Encodes and publishes an event on its type's channel.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Publishes already encoded bytes on a channel without validation.
    async fn publish_raw(&self, event_type: EventType, bytes: Vec<u8>) -> Result<()>;

    /// Joins a channel as a competing consumer.
    async fn subscribe(&self, event_type: EventType) -> Result<Subscription<Delivery>>;

    /// Acknowledges a delivery so it is not handed out again.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Publishes on the dead-letter channel.
    async fn publish_dead_letter(&self, dead_letter: DeadLetter) -> Result<()>;

    /// Returns every dead letter published so far.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Follows the dead-letter channel.
    async fn subscribe_dead_letters(&self) -> Result<Subscription<DeadLetter>>;
}
