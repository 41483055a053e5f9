//! In-process topic broker.
//!
//! [`MemoryBroker`] implements [`Transport`] with the parts of RabbitMQ's
//! behaviour the sync core relies on:
//!
//! - topic / direct / fanout exchanges and the default (`""`) exchange
//! - idempotent exchange, queue and binding declarations
//! - broker-named exclusive queues that vanish with their connection
//! - round-robin delivery to consumers, with delivery tags, limited per
//!   channel by the connection's prefetch
//! - nack with requeue, and dead-lettering (with `x-death` bookkeeping) on
//!   nack without requeue or on message TTL expiry
//! - unacked deliveries are requeued when their channel or connection goes away
//!
//! Tests use [`MemoryBroker::sever_connections`],
//! [`MemoryBroker::close_channels`] and [`MemoryBroker::refuse_connections`]
//! to simulate transport failure.
//!
//! # Example
//!
//! ```rust,ignore
//! let broker = MemoryBroker::new();
//! let connection = broker.connect("memory://", &ConnectOptions::default()).await?;
//! let channel = connection.open_channel().await?;
//! channel.declare_queue("catalog", &QueueOptions::default()).await?;
//! channel.bind_queue("catalog", "amq.topic", "model.#").await?;
//! broker.publish("amq.topic", "model.category.created", br#"{"id":"c1"}"#).await?;
//! ```

use super::topic;
use super::{
    BrokerError, Channel, ConnectOptions, Connection, Deliveries, ExchangeKind, ExchangeOptions,
    QueueOptions, Transport,
};
use crate::envelope::{Envelope, Headers};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info};

/// Exchanges every broker starts with.
const BUILTIN_EXCHANGES: [(&str, ExchangeKind); 3] = [
    ("amq.topic", ExchangeKind::Topic),
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
];

/// Reason recorded in `x-death` when a consumer rejects without requeue.
const REASON_REJECTED: &str = "rejected";

/// Reason recorded in `x-death` when a message outlives its queue TTL.
const REASON_EXPIRED: &str = "expired";

/// An in-process broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingEntry>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, Arc<Notify>>,
    channels: HashMap<u64, ChannelEntry>,
    next_tag: u64,
    next_message: u64,
    next_connection: u64,
    next_channel: u64,
    refused_connects: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingEntry {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<Ready>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Ready {
    id: u64,
    envelope: Envelope,
}

struct ChannelEntry {
    connection: u64,
    /// Unacked deliveries allowed on the channel (0 = unlimited)
    prefetch: u16,
}

struct ConsumerSlot {
    channel: u64,
    tag: String,
    sender: mpsc::UnboundedSender<Envelope>,
}

struct Unacked {
    queue: String,
    channel: u64,
    envelope: Envelope,
}

/// A ready message that must be expired after `ttl` if still unconsumed.
struct Expiry {
    queue: String,
    message: u64,
    ttl: Duration,
}

impl MemoryBroker {
    /// Create a broker with the built-in `amq.*` exchanges.
    pub fn new() -> Self {
        let mut state = BrokerState::default();
        for (name, kind) in BUILTIN_EXCHANGES {
            state.exchanges.insert(name.to_string(), kind);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Publish without a connection, the way an upstream service would.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.publish_with_headers(exchange, routing_key, payload, &Headers::default())
            .await
    }

    pub async fn publish_with_headers(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        let envelope = Envelope::new(routing_key, payload.to_vec())
            .with_exchange(exchange)
            .with_headers(headers.clone());

        let expiries = {
            let mut state = self.state.lock().await;
            state.route(exchange, envelope)?
        };
        self.schedule(expiries);
        Ok(())
    }

    /// Drop every live connection as if the network went away.
    pub async fn sever_connections(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        info!(connections = ids.len(), "Severing in-memory broker connections");
        for id in ids {
            state.drop_connection(id);
        }
    }

    /// Close every open channel but keep the connections up, the way a broker
    /// does after a channel-level error.
    pub async fn close_channels(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        info!(channels = ids.len(), "Closing in-memory broker channels");
        for id in ids {
            state.close_channel(id);
        }
    }

    /// Make the next `count` connection attempts fail.
    pub async fn refuse_connections(&self, count: u32) {
        self.state.lock().await.refused_connects = count;
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(name)
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in a queue (not yet delivered).
    pub async fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries awaiting ack/nack across all queues.
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Routing keys bound to a queue, as `(exchange, routing_key)` pairs.
    pub async fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Spawn TTL timers for newly queued messages.
    fn schedule(&self, expiries: Vec<Expiry>) {
        for expiry in expiries {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(expiry.ttl).await;
                let more = broker.state.lock().await.expire(&expiry);
                broker.schedule(more);
            });
        }
    }
}

impl BrokerState {
    fn route(&mut self, exchange: &str, mut envelope: Envelope) -> Result<Vec<Expiry>, BrokerError> {
        envelope.exchange = exchange.to_string();

        // The default exchange routes straight to the queue named by the key
        if exchange.is_empty() {
            let queue = envelope.routing_key.clone();
            return Ok(self.enqueue(&queue, envelope));
        }

        let kind = *self.exchanges.get(exchange).ok_or_else(|| BrokerError::NotFound {
            kind: "exchange",
            name: exchange.to_string(),
        })?;

        let targets: BTreeSet<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Topic => topic::matches(&b.routing_key, &envelope.routing_key),
                ExchangeKind::Direct => b.routing_key == envelope.routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() {
            debug!(
                exchange = %exchange,
                routing_key = %envelope.routing_key,
                "Message unroutable, dropping"
            );
        }

        let mut expiries = Vec::new();
        for queue in targets {
            expiries.extend(self.enqueue(&queue, envelope.clone()));
        }
        Ok(expiries)
    }

    /// Hand a message to a consumer, or park it in the queue.
    fn enqueue(&mut self, queue_name: &str, envelope: Envelope) -> Vec<Expiry> {
        let Some(queue) = self.queues.get(queue_name) else {
            debug!(queue = %queue_name, "Queue does not exist, dropping message");
            return Vec::new();
        };

        // Parked messages go first
        let envelope = if queue.ready.is_empty() {
            match self.deliver(queue_name, envelope) {
                Ok(()) => return Vec::new(),
                Err(envelope) => envelope,
            }
        } else {
            envelope
        };

        self.next_message += 1;
        let id = self.next_message;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Vec::new();
        };
        queue.ready.push_back(Ready { id, envelope });

        match queue.options.message_ttl {
            Some(ttl) => vec![Expiry {
                queue: queue_name.to_string(),
                message: id,
                ttl: Duration::from_millis(ttl),
            }],
            None => Vec::new(),
        }
    }

    /// Send `envelope` to the next consumer whose channel has prefetch room.
    /// Hands the envelope back when no consumer can take it.
    fn deliver(&mut self, queue_name: &str, mut envelope: Envelope) -> Result<(), Envelope> {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return Err(envelope);
            };
            let count = queue.consumers.len();
            let start = queue.next_consumer;
            let Some(index) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| self.has_capacity(queue.consumers[i].channel))
            else {
                return Err(envelope);
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            envelope.delivery_tag = tag;

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return Err(envelope);
            };
            queue.next_consumer = index.wrapping_add(1);

            let consumer = &queue.consumers[index];
            let channel = consumer.channel;
            match consumer.sender.send(envelope.clone()) {
                Ok(()) => {
                    self.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            channel,
                            envelope,
                        },
                    );
                    return Ok(());
                }
                Err(_) => {
                    debug!(queue = %queue_name, "Consumer went away, removing it");
                    queue.consumers.remove(index);
                }
            }
        }
    }

    fn has_capacity(&self, channel: u64) -> bool {
        match self.channels.get(&channel) {
            Some(entry) if entry.prefetch > 0 => {
                let in_flight = self.unacked.values().filter(|u| u.channel == channel).count();
                in_flight < usize::from(entry.prefetch)
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Deliver parked messages while some consumer has room.
    fn drain_ready(&mut self, queue_name: &str) {
        loop {
            let Some(ready) = self.queues.get_mut(queue_name).and_then(|q| q.ready.pop_front())
            else {
                return;
            };
            if let Err(envelope) = self.deliver(queue_name, ready.envelope) {
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.ready.push_front(Ready {
                        id: ready.id,
                        envelope,
                    });
                }
                return;
            }
        }
    }

    /// Republish through the queue's dead-letter exchange, if it has one.
    fn dead_letter(&mut self, queue_name: &str, mut envelope: Envelope, reason: &str) -> Vec<Expiry> {
        let Some(options) = self.queues.get(queue_name).map(|q| q.options.clone()) else {
            return Vec::new();
        };
        let Some(dlx) = options.dead_letter_exchange else {
            debug!(queue = %queue_name, reason = %reason, "No dead-letter exchange, dropping message");
            return Vec::new();
        };

        envelope.headers.record_death(
            queue_name,
            reason,
            &envelope.exchange,
            &envelope.routing_key,
            Utc::now(),
        );
        envelope.redelivered = false;
        if let Some(routing_key) = options.dead_letter_routing_key {
            envelope.routing_key = routing_key;
        }

        match self.route(&dlx, envelope) {
            Ok(expiries) => expiries,
            Err(e) => {
                debug!(queue = %queue_name, error = %e, "Dead-lettering failed, dropping message");
                Vec::new()
            }
        }
    }

    fn expire(&mut self, expiry: &Expiry) -> Vec<Expiry> {
        let Some(queue) = self.queues.get_mut(&expiry.queue) else {
            return Vec::new();
        };
        let Some(position) = queue.ready.iter().position(|r| r.id == expiry.message) else {
            // Already delivered
            return Vec::new();
        };
        let Some(ready) = queue.ready.remove(position) else {
            return Vec::new();
        };
        self.dead_letter(&expiry.queue, ready.envelope, REASON_EXPIRED)
    }

    fn attach_consumer(
        &mut self,
        queue_name: &str,
        channel: u64,
        tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, BrokerError> {
        let queue = self.queues.get_mut(queue_name).ok_or_else(|| BrokerError::NotFound {
            kind: "queue",
            name: queue_name.to_string(),
        })?;

        if queue.consumers.iter().any(|c| c.tag == tag) {
            return Err(BrokerError::PreconditionFailed(format!(
                "consumer tag '{}' already in use on queue '{}'",
                tag, queue_name
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push(ConsumerSlot {
            channel,
            tag: tag.to_string(),
            sender,
        });

        self.drain_ready(queue_name);
        Ok(receiver)
    }

    /// Cancel the channel's consumers and requeue what they had not settled.
    fn close_channel(&mut self, channel: u64) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }

        let orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut envelope = unacked.envelope;
                envelope.redelivered = true;
                self.enqueue(&unacked.queue, envelope);
            }
        }
        debug!(channel = channel, "In-memory channel closed");
    }

    fn drop_connection(&mut self, connection: u64) {
        let Some(closed) = self.connections.remove(&connection) else {
            return;
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !exclusive.contains(&b.queue));

        closed.notify_one();
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut state = self.state.lock().await;
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(BrokerError::Connection(format!("connection to {} refused", uri)));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let closed = Arc::new(Notify::new());
        state.connections.insert(id, closed.clone());
        debug!(connection = id, "In-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            closed,
            prefetch: options.prefetch,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: Arc<Notify>,
    prefetch: u16,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.broker.state.lock().await;
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::Closed);
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                prefetch: self.prefetch,
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
        }))
    }

    async fn closed(&self) {
        self.closed.notified().await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.state.lock().await.drop_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' already declared as {}",
                name,
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, BrokerError> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;

        let (name, owner) = if name.is_empty() {
            (format!("amq.gen-{}", uuid::Uuid::new_v4()), Some(self.connection))
        } else {
            let owner = options.exclusive.then_some(self.connection);
            (name.to_string(), owner)
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.options != *options {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' already declared with different options",
                    name
                )));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options: options.clone(),
                owner,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }

        let binding = BindingEntry {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError> {
        let receiver = {
            let mut state = self.broker.state.lock().await;
            self.ensure_open(&state)?;
            state.attach_consumer(queue, self.id, consumer_tag)?
        };

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|envelope| (Ok(envelope), receiver))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        state.drain_ready(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let expiries = {
            let mut state = self.broker.state.lock().await;
            self.ensure_open(&state)?;
            let unacked = state
                .unacked
                .remove(&delivery_tag)
                .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;

            let queue = unacked.queue.clone();
            let expiries = if requeue {
                let mut envelope = unacked.envelope;
                envelope.redelivered = true;
                state.enqueue(&unacked.queue, envelope)
            } else {
                state.dead_letter(&unacked.queue, unacked.envelope, REASON_REJECTED)
            };
            state.drain_ready(&queue);
            expiries
        };
        self.broker.schedule(expiries);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        {
            let state = self.broker.state.lock().await;
            self.ensure_open(&state)?;
        }
        self.broker
            .publish_with_headers(exchange, routing_key, payload, headers)
            .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.state.lock().await.close_channel(self.id);
        Ok(())
    }
}
