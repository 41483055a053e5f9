//! Static broker topology.
//!
//! Exchanges and queues that exist independently of any subscription (the
//! dead-letter exchange, retry queues with a TTL that feed messages back to
//! the main exchange, parking queues) are declared from configuration:
//!
//! ```toml
//! [[exchanges]]
//! name = "dlx.amq.topic"
//! kind = "topic"
//!
//! [[queues]]
//! name = "dlx.catalog.retry"
//! message_ttl = 5000
//! dead_letter_exchange = "amq.topic"
//! binding = { exchange = "dlx.amq.topic", routing_key = "model.#" }
//! ```
//!
//! Declaration order is exchanges, then queues, then bindings.

use crate::broker::{BrokerError, Channel, ExchangeKind, ExchangeOptions, QueueOptions};
use crate::connection::{setup_fn, Setup};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix of the exchanges every broker predeclares.
const RESERVED_PREFIX: &str = "amq.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeDeclaration {
    pub name: String,

    #[serde(default)]
    pub kind: ExchangeKind,

    #[serde(flatten)]
    pub options: ExchangeOptions,
}

impl ExchangeDeclaration {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            options: ExchangeOptions::default(),
        }
    }
}

/// A queue bound to one exchange at declaration time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StaticBinding {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,

    #[serde(flatten)]
    pub options: QueueOptions,

    #[serde(default)]
    pub binding: Option<StaticBinding>,
}

impl QueueDeclaration {
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
            binding: None,
        }
    }

    pub fn bound_to(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.binding = Some(StaticBinding {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }
}

/// Exchanges and queues to assert on every connect.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub exchanges: Vec<ExchangeDeclaration>,
    pub queues: Vec<QueueDeclaration>,
}

impl Topology {
    pub fn new(exchanges: Vec<ExchangeDeclaration>, queues: Vec<QueueDeclaration>) -> Self {
        Self { exchanges, queues }
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty()
    }

    /// Declare everything against `channel`. Stops at the first failure.
    pub async fn apply(&self, channel: &dyn Channel) -> Result<(), BrokerError> {
        for exchange in &self.exchanges {
            // Redeclaring the predeclared exchanges is refused by RabbitMQ
            if exchange.name.is_empty() || exchange.name.starts_with(RESERVED_PREFIX) {
                debug!(exchange = %exchange.name, "Skipping reserved exchange");
                continue;
            }
            channel
                .declare_exchange(&exchange.name, exchange.kind, &exchange.options)
                .await?;
            debug!(exchange = %exchange.name, kind = exchange.kind.as_str(), "Exchange declared");
        }

        for queue in &self.queues {
            channel.declare_queue(&queue.name, &queue.options).await?;
            debug!(queue = %queue.name, "Queue declared");
        }

        for queue in &self.queues {
            if let Some(binding) = &queue.binding {
                channel
                    .bind_queue(&queue.name, &binding.exchange, &binding.routing_key)
                    .await?;
                debug!(
                    queue = %queue.name,
                    exchange = %binding.exchange,
                    routing_key = %binding.routing_key,
                    "Queue bound"
                );
            }
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            "Topology applied"
        );
        Ok(())
    }

    /// Wrap as a connection setup callback.
    pub fn into_setup(self) -> Setup {
        let topology = Arc::new(self);
        setup_fn(move |channel| {
            let topology = topology.clone();
            async move { topology.apply(channel.as_ref()).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectOptions, MemoryBroker, Transport};

    fn retry_topology() -> Topology {
        Topology::new(
            vec![
                ExchangeDeclaration::new("amq.topic", ExchangeKind::Topic),
                ExchangeDeclaration::new("dlx.amq.topic", ExchangeKind::Topic),
            ],
            vec![QueueDeclaration::new(
                "dlx.catalog.retry",
                QueueOptions::default()
                    .with_message_ttl(5000)
                    .with_dead_letter_exchange("amq.topic"),
            )
            .bound_to("dlx.amq.topic", "model.#")],
        )
    }

    #[tokio::test]
    async fn test_apply_declares_in_order() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("memory://", &ConnectOptions::default()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        retry_topology().apply(channel.as_ref()).await.unwrap();

        assert!(broker.has_exchange("dlx.amq.topic").await);
        assert!(broker.has_queue("dlx.catalog.retry").await);
        assert_eq!(
            broker.bindings_for("dlx.catalog.retry").await,
            vec![("dlx.amq.topic".to_string(), "model.#".to_string())]
        );
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("memory://", &ConnectOptions::default()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let topology = retry_topology();

        topology.apply(channel.as_ref()).await.unwrap();
        topology.apply(channel.as_ref()).await.unwrap();

        assert_eq!(broker.bindings_for("dlx.catalog.retry").await.len(), 1);
    }

    #[tokio::test]
    async fn test_binding_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("memory://", &ConnectOptions::default()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        let topology = Topology::new(
            Vec::new(),
            vec![QueueDeclaration::new("parking", QueueOptions::default()).bound_to("nope", "#")],
        );

        let result = topology.apply(channel.as_ref()).await;
        assert!(matches!(result, Err(BrokerError::NotFound { kind: "exchange", .. })));
    }

    #[test]
    fn test_deserialize_declarations() {
        let exchange: ExchangeDeclaration =
            toml::from_str("name = \"dlx\"\nkind = \"direct\"\ndurable = false").unwrap();
        assert_eq!(exchange.kind, ExchangeKind::Direct);
        assert!(!exchange.options.durable);

        let queue: QueueDeclaration = toml::from_str(
            r##"
            name = "retry"
            message_ttl = 1000
            dead_letter_exchange = "amq.topic"
            binding = { exchange = "dlx", routing_key = "#" }
            "##,
        )
        .unwrap();
        assert_eq!(queue.options.message_ttl, Some(1000));
        assert!(queue.options.durable);
        assert_eq!(queue.binding.unwrap().routing_key, "#");
    }
}
