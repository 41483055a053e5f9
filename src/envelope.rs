//! Broker message types shared by the transports and the consumer loop.
//!
//! An [`Envelope`] is what a transport hands to the consumer loop: the routing
//! key, the raw body bytes, the decoded headers and the delivery tag used to
//! acknowledge it. Handlers receive a [`Message`], which pairs the decoded JSON
//! body with the envelope it came from.
//!
//! # Delivery history
//!
//! When a queue dead-letters a message, the broker prepends (or bumps) an entry
//! in the `x-death` header:
//!
//! ```json
//! [
//!   {"queue": "micro-catalog/sync-videos/category", "reason": "rejected", "count": 2},
//!   {"queue": "dlx.catalog.retry", "reason": "expired", "count": 2}
//! ]
//! ```
//!
//! Entries are ordered most recent first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Header carrying the broker's dead-letter history.
pub const DEATH_HEADER: &str = "x-death";

/// One entry of the `x-death` delivery-history header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from
    pub queue: String,

    /// Why it was dead-lettered (`rejected`, `expired`, `maxlen`)
    #[serde(default)]
    pub reason: String,

    /// How many times it was dead-lettered from this queue for this reason
    pub count: u64,

    /// Exchange the message was published to before dead-lettering
    #[serde(default)]
    pub exchange: String,

    /// Routing keys the message was published with
    #[serde(default, rename = "routing-keys")]
    pub routing_keys: Vec<String>,

    /// Time of the first dead-lettering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl DeathRecord {
    pub fn new(queue: impl Into<String>, reason: impl Into<String>, count: u64) -> Self {
        Self {
            queue: queue.into(),
            reason: reason.into(),
            count,
            exchange: String::new(),
            routing_keys: Vec::new(),
            time: None,
        }
    }
}

/// Message headers: the decoded delivery history plus any other textual headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    deaths: Vec<DeathRecord>,
    values: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the delivery history.
    pub fn with_deaths(mut self, deaths: Vec<DeathRecord>) -> Self {
        self.deaths = deaths;
        self
    }

    /// Add a plain header value.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Delivery history, most recent first. Empty when the header is absent.
    pub fn deaths(&self) -> &[DeathRecord] {
        &self.deaths
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.deaths.is_empty() && self.values.is_empty()
    }

    /// Record one dead-lettering the way the broker does: the entry for
    /// `(queue, reason)` is bumped and moved to the front, or inserted there.
    pub fn record_death(
        &mut self,
        queue: &str,
        reason: &str,
        exchange: &str,
        routing_key: &str,
        time: DateTime<Utc>,
    ) {
        let existing = self
            .deaths
            .iter()
            .position(|d| d.queue == queue && d.reason == reason);

        let entry = match existing {
            Some(index) => {
                let mut entry = self.deaths.remove(index);
                entry.count += 1;
                entry
            }
            None => DeathRecord {
                queue: queue.to_string(),
                reason: reason.to_string(),
                count: 1,
                exchange: exchange.to_string(),
                routing_keys: vec![routing_key.to_string()],
                time: Some(time),
            },
        };

        self.deaths.insert(0, entry);
    }
}

/// A message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Tag used to ack/nack this delivery on the channel that delivered it
    pub delivery_tag: u64,

    /// Exchange the message was published to
    pub exchange: String,

    /// Dot-separated routing key (e.g. "model.category.created")
    pub routing_key: String,

    /// Raw body bytes
    pub payload: Vec<u8>,

    /// Decoded headers
    pub headers: Headers,

    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

impl Envelope {
    /// Create an envelope with empty headers and a zero delivery tag.
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            headers: Headers::default(),
            redelivered: false,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = tag;
        self
    }

    /// Decode the body as JSON. A body that is not valid JSON decodes to `null`.
    pub fn decode_json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }

    /// Body as text for logging.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Death count of the most recent dead-lettering, if any.
    pub fn death_count(&self) -> Option<u64> {
        self.headers.deaths().first().map(|d| d.count)
    }
}

/// What a handler receives: the decoded body plus the envelope it came from.
#[derive(Debug, Clone)]
pub struct Message {
    /// Decoded JSON body (`null` when the body was not JSON)
    pub data: Value,

    /// The delivery this body came from
    pub envelope: Arc<Envelope>,
}

impl Message {
    pub fn new(data: Value, envelope: Arc<Envelope>) -> Self {
        Self { data, envelope }
    }

    /// Decode an envelope into a message.
    pub fn from_envelope(envelope: Envelope) -> Self {
        let data = envelope.decode_json();
        Self {
            data,
            envelope: Arc::new(envelope),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.envelope.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_json() {
        let envelope = Envelope::new("model.category.created", r#"{"id":"c1","name":"Action"}"#);
        assert_eq!(envelope.decode_json(), json!({"id": "c1", "name": "Action"}));
    }

    #[test]
    fn test_decode_invalid_json_is_null() {
        let envelope = Envelope::new("model.category.created", "not json {");
        assert_eq!(envelope.decode_json(), Value::Null);

        let message = Message::from_envelope(envelope);
        assert!(message.data.is_null());
        assert_eq!(message.routing_key(), "model.category.created");
    }

    #[test]
    fn test_death_count_uses_most_recent_entry() {
        let headers = Headers::new().with_deaths(vec![
            DeathRecord::new("retry", "expired", 2),
            DeathRecord::new("main", "rejected", 1),
        ]);
        let envelope = Envelope::new("a.b.c", "{}").with_headers(headers);
        assert_eq!(envelope.death_count(), Some(2));

        let plain = Envelope::new("a.b.c", "{}");
        assert_eq!(plain.death_count(), None);
    }

    #[test]
    fn test_record_death_bumps_and_reorders() {
        let mut headers = Headers::new();
        let now = Utc::now();

        headers.record_death("main", "rejected", "amq.topic", "model.genre.created", now);
        headers.record_death("retry", "expired", "dlx", "model.genre.created", now);
        headers.record_death("main", "rejected", "amq.topic", "model.genre.created", now);

        let deaths = headers.deaths();
        assert_eq!(deaths.len(), 2);
        assert_eq!(deaths[0].queue, "main");
        assert_eq!(deaths[0].count, 2);
        assert_eq!(deaths[0].routing_keys, vec!["model.genre.created".to_string()]);
        assert_eq!(deaths[1].queue, "retry");
        assert_eq!(deaths[1].count, 1);
    }

    #[test]
    fn test_death_record_serialization() {
        let record = DeathRecord::new("main", "rejected", 3);
        let json_str = serde_json::to_string(&record).unwrap();
        assert!(json_str.contains("\"queue\":\"main\""));
        assert!(json_str.contains("routing-keys"));
        assert!(!json_str.contains("time"));
    }
}
