//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! Maps the [`Transport`]/[`Connection`]/[`Channel`] traits onto a RabbitMQ
//! connection. Dead-letter settings become the usual queue arguments
//! (`x-dead-letter-exchange`, `x-dead-letter-routing-key`, `x-message-ttl`)
//! and the `x-death` header is decoded into [`Headers`] on every delivery.

use super::{
    BrokerError, Channel, ConnectOptions, Connection, Deliveries, ExchangeKind, ExchangeOptions,
    QueueOptions, Transport,
};
use crate::envelope::{DeathRecord, Envelope, Headers, DEATH_HEADER};
use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error};

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker).
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, BrokerError> {
        let connection = lapin::Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let lost = Arc::new(Notify::new());
        let on_lost = lost.clone();
        connection.on_error(move |e| {
            error!(error = %e, "AMQP connection error");
            on_lost.notify_one();
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            lost,
            prefetch: options.prefetch,
        }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    lost: Arc<Notify>,
    prefetch: u16,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(channel_error)?;

        if self.prefetch > 0 {
            channel
                .basic_qos(self.prefetch, BasicQosOptions::default())
                .await
                .map_err(channel_error)?;
        }

        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn closed(&self) {
        self.lost.notified().await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let declare = ExchangeDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(name, kind, declare, FieldTable::default())
            .await
            .map_err(channel_error)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, BrokerError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .channel
            .queue_declare(name, declare, queue_arguments(options))
            .await
            .map_err(channel_error)?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "AMQP consumer started");

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|delivery| Envelope {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    headers: delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(headers_from_table)
                        .unwrap_or_default(),
                    redelivered: delivery.redelivered,
                    payload: delivery.data,
                })
                .map_err(channel_error)
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(channel_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"));
        if !headers.is_empty() {
            properties = properties.with_headers(headers_to_table(headers));
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "closing")
            .await
            .map_err(channel_error)
    }
}

fn channel_error(e: lapin::Error) -> BrokerError {
    let message = e.to_string();
    if message.contains("PRECONDITION_FAILED") {
        BrokerError::PreconditionFailed(message)
    } else {
        BrokerError::Channel(message)
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &options.dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(routing_key) = &options.dead_letter_routing_key {
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key.as_str())),
        );
    }
    if let Some(ttl) = options.message_ttl {
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(i64::try_from(ttl).unwrap_or(i64::MAX)),
        );
    }
    arguments
}

/// Decode AMQP headers. `x-death` becomes structured history; other scalar
/// headers are kept as text.
fn headers_from_table(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();
    for (key, value) in table.inner() {
        let key = key.as_str();
        if key == DEATH_HEADER {
            if let AMQPValue::FieldArray(entries) = value {
                let deaths = entries
                    .as_slice()
                    .iter()
                    .filter_map(|entry| match entry {
                        AMQPValue::FieldTable(entry) => death_from_table(entry),
                        _ => None,
                    })
                    .collect();
                headers = headers.with_deaths(deaths);
            }
            continue;
        }
        if let Some(text) = value_as_text(value) {
            headers = headers.with_value(key, text);
        }
    }
    headers
}

fn death_from_table(table: &FieldTable) -> Option<DeathRecord> {
    let mut record = DeathRecord::new(String::new(), String::new(), 0);
    let mut has_queue = false;

    for (key, value) in table.inner() {
        match key.as_str() {
            "queue" => {
                record.queue = value_as_text(value)?;
                has_queue = true;
            }
            "reason" => record.reason = value_as_text(value).unwrap_or_default(),
            "exchange" => record.exchange = value_as_text(value).unwrap_or_default(),
            "count" => record.count = value_as_u64(value).unwrap_or(0),
            "routing-keys" => {
                if let AMQPValue::FieldArray(keys) = value {
                    record.routing_keys = keys.as_slice().iter().filter_map(value_as_text).collect();
                }
            }
            "time" => {
                if let AMQPValue::Timestamp(seconds) = value {
                    record.time = i64::try_from(*seconds)
                        .ok()
                        .and_then(|s| DateTime::from_timestamp(s, 0));
                }
            }
            _ => {}
        }
    }

    has_queue.then_some(record)
}

fn value_as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        other => value_as_u64(other).map(|n| n.to_string()),
    }
}

fn value_as_u64(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::Timestamp(n) => Some(*n),
        _ => None,
    }
}

fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.values() {
        table.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }

    if !headers.deaths().is_empty() {
        let deaths: Vec<AMQPValue> = headers
            .deaths()
            .iter()
            .map(|death| AMQPValue::FieldTable(death_to_table(death)))
            .collect();
        table.insert(
            ShortString::from(DEATH_HEADER),
            AMQPValue::FieldArray(FieldArray::from(deaths)),
        );
    }
    table
}

fn death_to_table(death: &DeathRecord) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        ShortString::from("queue"),
        AMQPValue::LongString(LongString::from(death.queue.as_str())),
    );
    table.insert(
        ShortString::from("reason"),
        AMQPValue::LongString(LongString::from(death.reason.as_str())),
    );
    table.insert(
        ShortString::from("count"),
        AMQPValue::LongLongInt(i64::try_from(death.count).unwrap_or(i64::MAX)),
    );
    table.insert(
        ShortString::from("exchange"),
        AMQPValue::LongString(LongString::from(death.exchange.as_str())),
    );
    let keys: Vec<AMQPValue> = death
        .routing_keys
        .iter()
        .map(|k| AMQPValue::LongString(LongString::from(k.as_str())))
        .collect();
    table.insert(
        ShortString::from("routing-keys"),
        AMQPValue::FieldArray(FieldArray::from(keys)),
    );
    if let Some(time) = death.time {
        table.insert(
            ShortString::from("time"),
            AMQPValue::Timestamp(u64::try_from(time.timestamp()).unwrap_or(0)),
        );
    }
    table
}
