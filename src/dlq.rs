//! Dead-letter policy for failed messages.
//!
//! A message that fails is normally rejected so the broker routes it through
//! the queue's dead-letter exchange (typically into a retry queue with a TTL
//! that feeds it back to the main exchange). Each cycle bumps the `x-death`
//! count. Once that count reaches `max_attempts` the message is acknowledged
//! instead and logged as a terminal failure, which ends the cycle.
//!
//! # Example
//!
//! ```rust,ignore
//! use catalog_sync::dlq::{DeadLetterPolicy, Disposition};
//!
//! let policy = DeadLetterPolicy::new(3);
//! match policy.resolve(&envelope, Outcome::Reject) {
//!     Disposition::Retry(outcome) => settle(outcome),
//!     Disposition::Exhausted { attempts } => ack_and_log(attempts),
//! }
//! ```

use crate::envelope::Envelope;
use crate::subscription::Outcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

/// Default number of dead-letter cycles before a message is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u64 = 3;

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep cycling with the given outcome
    Retry(Outcome),
    /// Retry ceiling reached: acknowledge and log
    Exhausted { attempts: u64 },
}

impl Disposition {
    /// Broker outcome for this disposition.
    pub fn outcome(&self) -> Outcome {
        match self {
            Disposition::Retry(outcome) => *outcome,
            Disposition::Exhausted { .. } => Outcome::Ack,
        }
    }
}

/// Decides whether a failed message may keep cycling.
#[derive(Debug, Clone, Copy)]
pub struct DeadLetterPolicy {
    max_attempts: u64,
}

impl DeadLetterPolicy {
    pub fn new(max_attempts: u64) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    /// Death count of the most recent `x-death` entry, 0 without history.
    pub fn attempts(&self, envelope: &Envelope) -> u64 {
        envelope.death_count().unwrap_or(0)
    }

    /// `true` while the message may be requeued / dead-lettered again.
    pub fn should_dead_letter(&self, envelope: &Envelope) -> bool {
        self.attempts(envelope) < self.max_attempts
    }

    pub fn resolve(&self, envelope: &Envelope, failure_outcome: Outcome) -> Disposition {
        if self.should_dead_letter(envelope) {
            Disposition::Retry(failure_outcome)
        } else {
            Disposition::Exhausted {
                attempts: self.attempts(envelope),
            }
        }
    }
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

/// A message dropped after exhausting its retries.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalFailure {
    pub queue: String,
    pub routing_key: String,
    pub payload: String,
    pub error: String,
    pub attempts: u64,
    pub failed_at: DateTime<Utc>,
}

impl TerminalFailure {
    pub fn new(queue: &str, envelope: &Envelope, error: &str, attempts: u64) -> Self {
        Self {
            queue: queue.to_string(),
            routing_key: envelope.routing_key.clone(),
            payload: envelope.payload_lossy().into_owned(),
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Emit at error level. This log line is the only record of the message.
    pub fn log(&self) {
        let record = serde_json::to_string(self).unwrap_or_default();
        error!(
            queue = %self.queue,
            routing_key = %self.routing_key,
            attempts = self.attempts,
            error = %self.error,
            record = %record,
            "Message exhausted its retries, acknowledging and dropping"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DeathRecord, Headers};

    fn with_deaths(deaths: Vec<DeathRecord>) -> Envelope {
        Envelope::new("model.category.created", r#"{"id":"c1"}"#)
            .with_headers(Headers::new().with_deaths(deaths))
    }

    #[test]
    fn test_no_history_is_eligible() {
        let policy = DeadLetterPolicy::default();
        let envelope = Envelope::new("model.category.created", "{}");
        assert_eq!(policy.attempts(&envelope), 0);
        assert!(policy.should_dead_letter(&envelope));
        assert_eq!(
            policy.resolve(&envelope, Outcome::Reject),
            Disposition::Retry(Outcome::Reject)
        );
    }

    #[test]
    fn test_below_ceiling_keeps_cycling() {
        let policy = DeadLetterPolicy::default();
        let envelope = with_deaths(vec![DeathRecord::new("main", "rejected", 2)]);
        assert!(policy.should_dead_letter(&envelope));
        assert_eq!(
            policy.resolve(&envelope, Outcome::Requeue).outcome(),
            Outcome::Requeue
        );
    }

    #[test]
    fn test_ceiling_reached_is_exhausted() {
        let policy = DeadLetterPolicy::default();
        let envelope = with_deaths(vec![DeathRecord::new("main", "rejected", 3)]);
        assert!(!policy.should_dead_letter(&envelope));

        let disposition = policy.resolve(&envelope, Outcome::Reject);
        assert_eq!(disposition, Disposition::Exhausted { attempts: 3 });
        assert_eq!(disposition.outcome(), Outcome::Ack);
    }

    #[test]
    fn test_only_most_recent_entry_counts() {
        let policy = DeadLetterPolicy::new(3);
        let envelope = with_deaths(vec![
            DeathRecord::new("retry", "expired", 1),
            DeathRecord::new("main", "rejected", 5),
        ]);
        assert!(policy.should_dead_letter(&envelope));
    }

    #[test]
    fn test_terminal_failure_serializes() {
        let envelope = with_deaths(Vec::new());
        let failure = TerminalFailure::new("main", &envelope, "boom", 3);
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["routing_key"], "model.category.created");
        assert_eq!(json["payload"], r#"{"id":"c1"}"#);
        assert_eq!(json["attempts"], 3);
    }
}
