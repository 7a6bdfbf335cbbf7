//! In-process broker for tests, demos and single-node deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Broker, Delivery, Subscription};
use crate::codec::EventCodec;
use crate::core::{DeadLetter, Event, EventType};
use crate::errors::Result;

#[derive(Debug, Default)]
struct Channel {
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    backlog: VecDeque<Delivery>,
    next: usize,
}

impl Channel {
    /// Hands the delivery to the next live subscriber, or queues it.
    fn route(&mut self, delivery: Delivery) {
        let mut delivery = delivery;
        while !self.subscribers.is_empty() {
            let idx = self.next % self.subscribers.len();
            match self.subscribers[idx].send(delivery) {
                Ok(()) => {
                    self.next = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.subscribers.swap_remove(idx);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

/// Counters describing broker traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages published.
    pub published: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries handed out again.
    pub redelivered: u64,
    /// Dead letters published.
    pub dead_lettered: u64,
}

/// Broker keeping channels in memory.
///
/// Competing consumers of one channel receive deliveries round-robin.
/// Messages published while a channel has no consumer wait in a backlog.
/// Unacknowledged deliveries can be handed out again with
/// [`InMemoryBroker::redeliver_unacked`].
#[derive(Debug)]
pub struct InMemoryBroker {
    codec: EventCodec,
    channels: Mutex<HashMap<EventType, Channel>>,
    unacked: DashMap<u64, Delivery>,
    next_delivery_id: AtomicU64,
    dead_letters: RwLock<Vec<DeadLetter>>,
    dead_letter_subscribers: Mutex<Vec<mpsc::UnboundedSender<DeadLetter>>>,
    published: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(EventCodec::default())
    }
}

impl InMemoryBroker {
    /// Creates a broker encoding events with `codec`.
    #[must_use]
    pub fn new(codec: EventCodec) -> Self {
        Self {
            codec,
            channels: Mutex::new(HashMap::new()),
            unacked: DashMap::new(),
            next_delivery_id: AtomicU64::new(1),
            dead_letters: RwLock::new(Vec::new()),
            dead_letter_subscribers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
        }
    }

    fn route(&self, delivery: Delivery) {
        self.unacked.insert(delivery.delivery_id, delivery.clone());
        self.channels
            .lock()
            .entry(delivery.event_type)
            .or_default()
            .route(delivery);
    }

    /// Hands every unacknowledged delivery out again, as a broker does
    /// after a consumer crash. Returns how many were redelivered.
    pub fn redeliver_unacked(&self) -> usize {
        let pending: Vec<Delivery> = self
            .unacked
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for mut delivery in pending.iter().cloned() {
            delivery.redelivered = true;
            self.route(delivery);
        }

        self.redelivered
            .fetch_add(pending.len() as u64, Ordering::Relaxed);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Redelivered unacked messages");
        }
        pending.len()
    }

    /// Number of deliveries not yet acknowledged.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    /// Number of messages waiting for a consumer on a channel.
    #[must_use]
    pub fn backlog_len(&self, event_type: EventType) -> usize {
        self.channels
            .lock()
            .get(&event_type)
            .map_or(0, |channel| channel.backlog.len())
    }

    /// Returns a snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_letters.read().len() as u64,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, event: &Event) -> Result<()> {
        let bytes = self.codec.encode(event)?;
        debug!(
            job_id = %event.job_id,
            event_type = %event.event_type,
            stage = ?event.stage,
            "Publishing event"
        );
        self.publish_raw(event.event_type, bytes).await
    }

    async fn publish_raw(&self, event_type: EventType, bytes: Vec<u8>) -> Result<()> {
        let delivery = Delivery {
            delivery_id: self.next_delivery_id.fetch_add(1, Ordering::Relaxed),
            event_type,
            bytes,
            redelivered: false,
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        self.route(delivery);
        Ok(())
    }

    async fn subscribe(&self, event_type: EventType) -> Result<Subscription<Delivery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        let channel = channels.entry(event_type).or_default();

        channel.subscribers.push(tx);
        let backlog: Vec<Delivery> = channel.backlog.drain(..).collect();
        for delivery in backlog {
            channel.route(delivery);
        }

        Ok(Subscription::new(rx))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.unacked.remove(&delivery.delivery_id).is_some() {
            self.acked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn publish_dead_letter(&self, dead_letter: DeadLetter) -> Result<()> {
        warn!(
            event_type = %dead_letter.event_type,
            job_id = ?dead_letter.job_id(),
            stage = ?dead_letter.stage(),
            error_kind = %dead_letter.error_kind,
            attempts = dead_letter.attempts,
            reason = %dead_letter.reason,
            "Dead letter published"
        );

        self.dead_letter_subscribers
            .lock()
            .retain(|tx| tx.send(dead_letter.clone()).is_ok());
        self.dead_letters.write().push(dead_letter);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.dead_letters.read().clone())
    }

    async fn subscribe_dead_letters(&self) -> Result<Subscription<DeadLetter>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.dead_letter_subscribers.lock().push(tx);
        Ok(Subscription::new(rx))
    }
}
