//! High-level event bus built on a pluggable store
//!
//! `EventBus` owns the shared store and a registry of per-handle
//! brokers, created lazily on first subscribe. Consumer-facing calls
//! are routed by handle id; `attach` wraps the raw subscribe into a
//! pull-style `Consumer` handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::broker::Broker;
use crate::error::{EventError, Result};
use crate::store::EventStore;
use crate::types::{BrokerStatus, Event, SubscribeOptions, Subscription};

/// Per-consumer delivery channel depth
///
/// Deliveries are gated one-in-flight per broker, so the channel
/// never holds more than a single undrained event for a well-behaved
/// consumer; the headroom only absorbs scheduling slack.
const DELIVERY_CAPACITY: usize = 16;

/// Event bus: shared store + lazily created per-handle brokers
pub struct EventBus {
    store: Arc<dyn EventStore>,
    brokers: RwLock<HashMap<String, Broker>>,
}

impl EventBus {
    /// Create an event bus from a store
    pub fn new(store: impl EventStore + 'static) -> Self {
        Self::with_store(Arc::new(store))
    }

    /// Create an event bus from a shared store
    pub fn with_store(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            brokers: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying store
    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    /// Register a consumer on a handle, creating its broker if needed
    ///
    /// The sink receives delivered events; see `Broker::subscribe`
    /// for idempotency and start-position semantics.
    pub async fn subscribe(
        &self,
        handle_id: &str,
        consumer_id: &str,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Event>,
    ) -> Result<Subscription> {
        let broker = self.broker_or_spawn(handle_id).await?;
        broker.subscribe(consumer_id, opts, sink).await
    }

    /// Attach a consumer with a generated id
    pub async fn attach(&self, handle_id: &str, opts: SubscribeOptions) -> Result<Consumer> {
        let consumer_id = format!("consumer-{}", uuid::Uuid::new_v4());
        self.attach_as(handle_id, &consumer_id, opts).await
    }

    /// Attach a named consumer, returning a pull-style handle
    ///
    /// Unlike raw `subscribe`, attaching an already-registered
    /// consumer id is an error: the existing subscription keeps its
    /// original delivery channel, so a second handle would never
    /// receive anything.
    pub async fn attach_as(
        &self,
        handle_id: &str,
        consumer_id: &str,
        opts: SubscribeOptions,
    ) -> Result<Consumer> {
        let broker = self.broker_or_spawn(handle_id).await?;

        if broker.subscription(consumer_id).await?.is_some() {
            return Err(EventError::Subscribe {
                handle: handle_id.to_string(),
                consumer: consumer_id.to_string(),
                reason: "consumer is already attached".to_string(),
            });
        }

        let (sink, events) = mpsc::channel(DELIVERY_CAPACITY);
        let subscription = broker.subscribe(consumer_id, opts, sink).await?;

        Ok(Consumer {
            id: consumer_id.to_string(),
            broker,
            events,
            subscription,
        })
    }

    /// Remove a consumer's subscription
    pub async fn unsubscribe(&self, handle_id: &str, consumer_id: &str) -> Result<()> {
        let broker = self.lookup(handle_id).await?;
        broker.unsubscribe(consumer_id).await
    }

    /// Acknowledge a delivered event
    pub async fn ack(&self, handle_id: &str, consumer_id: &str, number: u64) -> Result<u64> {
        let broker = self.lookup(handle_id).await?;
        broker.ack(consumer_id, number).await
    }

    /// Snapshot a consumer's subscription
    pub async fn subscription(
        &self,
        handle_id: &str,
        consumer_id: &str,
    ) -> Result<Option<Subscription>> {
        let broker = self.lookup(handle_id).await?;
        broker.subscription(consumer_id).await
    }

    /// Snapshot a broker's dispatch state
    pub async fn status(&self, handle_id: &str) -> Result<BrokerStatus> {
        let broker = self.lookup(handle_id).await?;
        broker.status().await
    }

    /// Handle ids with a running broker
    pub async fn handles(&self) -> Vec<String> {
        let brokers = self.brokers.read().await;
        brokers.keys().cloned().collect()
    }

    async fn broker_or_spawn(&self, handle_id: &str) -> Result<Broker> {
        {
            let brokers = self.brokers.read().await;
            if let Some(broker) = brokers.get(handle_id) {
                return Ok(broker.clone());
            }
        }

        let mut brokers = self.brokers.write().await;
        // Another caller may have won the race
        if let Some(broker) = brokers.get(handle_id) {
            return Ok(broker.clone());
        }

        let broker = Broker::open(self.store.clone(), handle_id).await?;
        brokers.insert(handle_id.to_string(), broker.clone());
        Ok(broker)
    }

    async fn lookup(&self, handle_id: &str) -> Result<Broker> {
        let brokers = self.brokers.read().await;
        brokers
            .get(handle_id)
            .cloned()
            .ok_or_else(|| EventError::NotFound(handle_id.to_string()))
    }
}

/// Pull-style consumer handle
///
/// Wraps the delivery channel together with the owning broker so a
/// consumer can receive and acknowledge without further plumbing.
/// Dropping the handle closes the delivery channel; the broker
/// removes the subscription at its next delivery attempt.
#[derive(Debug)]
pub struct Consumer {
    id: String,
    broker: Broker,
    events: mpsc::Receiver<Event>,
    subscription: Subscription,
}

impl Consumer {
    /// Consumer identity
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle this consumer is attached to
    pub fn handle_id(&self) -> &str {
        self.broker.handle_id()
    }

    /// The subscription as of attach time
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Receive the next delivered event
    ///
    /// Returns `None` once the broker is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Acknowledge a delivered event by number
    pub async fn ack(&self, number: u64) -> Result<u64> {
        self.broker.ack(&self.id, number).await
    }

    /// Remove the subscription and consume the handle
    pub async fn detach(self) -> Result<()> {
        self.broker.unsubscribe(&self.id).await
    }
}
