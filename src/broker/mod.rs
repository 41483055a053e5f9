//! Broker transport abstraction.
//!
//! The sync core talks to the broker through three traits:
//!
//! - [`Transport`]: opens connections to a broker URI
//! - [`Connection`]: opens channels and reports when the link is lost
//! - [`Channel`]: declares topology, consumes, acks/nacks and publishes
//!
//! Two transports ship with the crate:
//!
//! - [`AmqpTransport`]: AMQP 0-9-1 via `lapin` (RabbitMQ)
//! - [`MemoryBroker`]: an in-process topic broker with dead-lettering, used by
//!   tests and `memory://` local runs

pub mod amqp;
pub mod memory;
pub mod topic;

use crate::envelope::{Envelope, Headers};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

pub use amqp::AmqpTransport;
pub use memory::MemoryBroker;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not establish or keep a connection
    #[error("connection error: {0}")]
    Connection(String),

    /// A channel-level operation failed
    #[error("channel error: {0}")]
    Channel(String),

    /// A declaration conflicts with what the broker already has
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Referenced exchange or queue does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Ack/nack for a tag the channel does not know
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// The connection was closed
    #[error("connection closed")]
    Closed,
}

/// Stream of deliveries for one consumer. Ends when the connection goes away.
pub type Deliveries = BoxStream<'static, Result<Envelope, BrokerError>>;

/// Exchange routing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Options for an exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeOptions {
    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Options for a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueOptions {
    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub exclusive: bool,

    #[serde(default)]
    pub auto_delete: bool,

    /// Exchange that rejected/expired messages are republished to
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,

    /// Routing key used when dead-lettering (defaults to the original key)
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,

    /// Per-message TTL in milliseconds
    #[serde(default)]
    pub message_ttl: Option<u64>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }
}

impl QueueOptions {
    /// Options for a broker-named queue owned by one connection.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl_ms: u64) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }
}

fn default_true() -> bool {
    true
}

/// Per-connection options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Unacked deliveries allowed per channel (0 = unlimited)
    pub prefetch: u16,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { prefetch: 10 }
    }
}

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Resolves once the connection has been lost.
    async fn closed(&self);

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel on a live connection.
///
/// Every declaration is idempotent: re-declaring with identical options is a
/// no-op, which is what lets setup callbacks re-run after a reconnect.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError>;

    /// Declare a queue and return its name. An empty name asks the broker to
    /// generate one.
    async fn declare_queue(&self, name: &str, options: &QueueOptions)
        -> Result<String, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError>;

    /// Close the channel. Its consumers stop and unsettled deliveries go
    /// back to their queues.
    async fn close(&self) -> Result<(), BrokerError>;
}
