//! Consumer loop and dispatcher.
//!
//! For every [`QueueBinding`] the dispatcher produces a connection setup
//! callback that declares the queue, binds each route and starts a consumer.
//! The consumer loop pulls deliveries and hands each one to its own task, so a
//! slow handler never holds up the next message. When the delivery stream
//! ends or fails, the loop reports its channel to the connection manager,
//! which replaces the channel and restarts every consumer.
//!
//! # Flow
//!
//! ```text
//! delivery ──► decode JSON (invalid → null)
//!          ──► first route whose pattern matches (none → ack)
//!          ──► handler
//!                ├─ Ok(Ack | Requeue | Reject) ──► ack / nack+requeue / nack
//!                └─ Err ──► log, DeadLetterPolicy
//!                             ├─ Retry(outcome) ──► failure outcome (default Reject)
//!                             └─ Exhausted     ──► ack, log terminal failure
//! ```

use crate::broker::{BrokerError, Channel, Deliveries};
use crate::connection::{setup_fn, FaultReporter, Setup};
use crate::dlq::{DeadLetterPolicy, Disposition, TerminalFailure};
use crate::envelope::{Envelope, Message};
use crate::subscription::{Outcome, QueueBinding};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    unrouted: AtomicU64,
    failed: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub unrouted: u64,
    pub failed: u64,
    pub exhausted: u64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    fn record_settled(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Ack => &self.acked,
            Outcome::Requeue => &self.requeued,
            Outcome::Reject => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Turns deliveries into handler calls and handler results into acks.
pub struct Dispatcher {
    policy: DeadLetterPolicy,
    /// Outcome applied to a failed message that may still cycle
    failure_outcome: Outcome,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(policy: DeadLetterPolicy, failure_outcome: Outcome) -> Self {
        Self {
            policy,
            failure_outcome,
            metrics: Arc::new(DispatchMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        self.metrics.clone()
    }

    /// Setup callback that (re)starts the consumer for `binding`.
    pub fn setup_for(
        self: &Arc<Self>,
        binding: QueueBinding,
        consumer_tag: String,
        faults: FaultReporter,
    ) -> Setup {
        let dispatcher = Arc::clone(self);
        let binding = Arc::new(binding);

        setup_fn(move |channel: Arc<dyn Channel>| {
            let dispatcher = dispatcher.clone();
            let binding = binding.clone();
            let consumer_tag = consumer_tag.clone();
            let faults = faults.clone();

            async move {
                let queue = channel.declare_queue(&binding.queue, &binding.options).await?;
                for route in &binding.routes {
                    channel
                        .bind_queue(&queue, &route.exchange, &route.pattern)
                        .await?;
                }
                let deliveries = channel.consume(&queue, &consumer_tag).await?;

                info!(
                    queue = %queue,
                    routes = binding.routes.len(),
                    consumer_tag = %consumer_tag,
                    "Consuming"
                );
                tokio::spawn(dispatcher.run(binding, queue, channel, deliveries, faults));
                Ok::<(), BrokerError>(())
            }
        })
    }

    /// Pull deliveries until the stream ends or fails, then report the channel.
    async fn run(
        self: Arc<Self>,
        binding: Arc<QueueBinding>,
        queue: String,
        channel: Arc<dyn Channel>,
        mut deliveries: Deliveries,
        faults: FaultReporter,
    ) {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(envelope) => {
                    let dispatcher = self.clone();
                    let binding = binding.clone();
                    let queue = queue.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        let delivery_tag = envelope.delivery_tag;
                        let outcome = dispatcher.dispatch(&binding, &queue, envelope).await;
                        dispatcher
                            .settle(channel.as_ref(), &queue, delivery_tag, outcome)
                            .await;
                    });
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Delivery stream failed");
                    break;
                }
            }
        }
        debug!(queue = %queue, "Consumer stopped");
        faults.channel_failed(channel);
    }

    /// Run the matching handler and decide the broker outcome.
    pub async fn dispatch(&self, binding: &QueueBinding, queue: &str, envelope: Envelope) -> Outcome {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);

        let Some(route) = binding.handler_for(&envelope.routing_key) else {
            self.metrics.unrouted.fetch_add(1, Ordering::Relaxed);
            warn!(
                queue = %queue,
                routing_key = %envelope.routing_key,
                "No handler matches routing key, acknowledging"
            );
            return Outcome::Ack;
        };

        let handler = route.handler.clone();
        let message = Message::from_envelope(envelope);
        let envelope = message.envelope.clone();

        debug!(
            queue = %queue,
            routing_key = %envelope.routing_key,
            handler = %handler.name(),
            redelivered = envelope.redelivered,
            "Dispatching message"
        );

        let error = match handler.handle(message).await {
            Ok(outcome) => return outcome,
            Err(e) => e,
        };

        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            queue = %queue,
            routing_key = %envelope.routing_key,
            handler = %handler.name(),
            payload = %envelope.payload_lossy(),
            error = %error,
            "Handler failed"
        );

        match self.policy.resolve(&envelope, self.failure_outcome) {
            Disposition::Retry(outcome) => outcome,
            Disposition::Exhausted { attempts } => {
                self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
                TerminalFailure::new(queue, &envelope, &error.to_string(), attempts).log();
                Outcome::Ack
            }
        }
    }

    async fn settle(&self, channel: &dyn Channel, queue: &str, delivery_tag: u64, outcome: Outcome) {
        let result = match outcome {
            Outcome::Ack => channel.ack(delivery_tag).await,
            Outcome::Requeue => channel.nack(delivery_tag, true).await,
            Outcome::Reject => channel.nack(delivery_tag, false).await,
        };

        match result {
            Ok(()) => self.metrics.record_settled(outcome),
            // The broker redelivers unsettled messages once the connection is back
            Err(e) => warn!(
                queue = %queue,
                delivery_tag = delivery_tag,
                outcome = ?outcome,
                error = %e,
                "Failed to settle delivery"
            ),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DeadLetterPolicy::default(), Outcome::Reject)
    }
}
