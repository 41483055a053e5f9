//! Subscription registry.
//!
//! Handler owners (the per-model sync services) implement [`Subscriber`] and
//! hand the registry explicit [`SubscriptionDescriptor`]s. The registry turns
//! them into one [`QueueBinding`] per queue: the queue options plus every
//! `(exchange, pattern, handler)` route the consumer loop will match against.
//!
//! # Architecture
//!
//! ```text
//! CategorySync ──┐                         ┌─ micro-catalog/sync-videos/category
//! GenreSync ─────┼─► SubscriptionRegistry ─┤    model.category.* → CategorySync
//! CastMemberSync ┘                         ├─ micro-catalog/sync-videos/genre
//!                                          │    model.genre.*            → GenreSync
//!                                          │    model.genre_categories.* → GenreSync
//!                                          └─ ...
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = SubscriptionRegistry::new();
//! registry.register(Arc::new(CategorySync::new(stores, validator)));
//!
//! for binding in registry.bindings() {
//!     println!("{} has {} routes", binding.queue, binding.routes.len());
//! }
//! ```

use crate::broker::{topic, QueueOptions};
use crate::envelope::Message;
use crate::sync::SyncError;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to tell the broker about a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Processed (or deliberately dropped)
    #[default]
    Ack,
    /// Put it back on the queue for another attempt
    Requeue,
    /// Drop it from the queue; goes to the dead-letter exchange if configured
    Reject,
}

/// A message handler bound to a routing pattern.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, message: Message) -> Result<Outcome, SyncError>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, SyncError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: Message) -> Result<Outcome, SyncError> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, SyncError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// One subscription: where messages come from and who handles them.
#[derive(Clone)]
pub struct SubscriptionDescriptor {
    pub exchange: String,
    pub routing_keys: Vec<String>,
    /// Empty for a broker-named exclusive queue
    pub queue: String,
    pub queue_options: QueueOptions,
    pub handler: Arc<dyn MessageHandler>,
}

impl SubscriptionDescriptor {
    pub fn new(exchange: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_keys: Vec::new(),
            queue: String::new(),
            queue_options: QueueOptions::default(),
            handler,
        }
    }

    pub fn routing_key(mut self, pattern: impl Into<String>) -> Self {
        self.routing_keys.push(pattern.into());
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = name.into();
        self
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("exchange", &self.exchange)
            .field("routing_keys", &self.routing_keys)
            .field("queue", &self.queue)
            .field("queue_options", &self.queue_options)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Something that owns message handlers.
pub trait Subscriber: Send + Sync + 'static {
    /// Descriptors whose handlers hold a reference back to `self`.
    fn subscriptions(self: Arc<Self>) -> Vec<SubscriptionDescriptor>;
}

/// A routing pattern on a queue and the handler it selects.
#[derive(Clone)]
pub struct Route {
    pub exchange: String,
    pub pattern: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("exchange", &self.exchange)
            .field("pattern", &self.pattern)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Everything the consumer loop needs for one queue.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    /// Empty for a broker-named exclusive queue
    pub queue: String,
    pub options: QueueOptions,
    pub routes: Vec<Route>,
}

impl QueueBinding {
    /// First route, in registration order, whose pattern matches.
    pub fn handler_for(&self, routing_key: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| topic::matches(&route.pattern, routing_key))
    }
}

/// Collects descriptors from every handler owner.
#[derive(Default)]
pub struct SubscriptionRegistry {
    descriptors: Vec<SubscriptionDescriptor>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect an owner's descriptors. An owner with none is fine.
    pub fn register<S: Subscriber>(&mut self, owner: Arc<S>) -> Vec<SubscriptionDescriptor> {
        let descriptors = owner.subscriptions();
        if descriptors.is_empty() {
            debug!("Subscriber registered without subscriptions");
        }

        for descriptor in &descriptors {
            if descriptor.routing_keys.is_empty() {
                warn!(
                    handler = %descriptor.handler.name(),
                    queue = %descriptor.queue,
                    "Subscription has no routing keys and will never receive messages"
                );
            }
            debug!(
                handler = %descriptor.handler.name(),
                exchange = %descriptor.exchange,
                queue = %descriptor.queue,
                routing_keys = ?descriptor.routing_keys,
                "Registering subscription"
            );
        }

        self.descriptors.extend(descriptors.iter().cloned());
        descriptors
    }

    pub fn descriptors(&self) -> &[SubscriptionDescriptor] {
        &self.descriptors
    }

    pub fn handler_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Group descriptors into per-queue bindings, in registration order.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        let mut bindings: Vec<QueueBinding> = Vec::new();

        for descriptor in &self.descriptors {
            let routes = descriptor.routing_keys.iter().map(|pattern| Route {
                exchange: descriptor.exchange.clone(),
                pattern: pattern.clone(),
                handler: descriptor.handler.clone(),
            });

            if descriptor.queue.is_empty() {
                bindings.push(QueueBinding {
                    queue: String::new(),
                    options: QueueOptions::exclusive(),
                    routes: routes.collect(),
                });
                continue;
            }

            match bindings.iter_mut().find(|b| b.queue == descriptor.queue) {
                Some(binding) => {
                    if binding.options != descriptor.queue_options {
                        warn!(
                            queue = %descriptor.queue,
                            handler = %descriptor.handler.name(),
                            "Conflicting queue options, keeping the first declaration"
                        );
                    }
                    binding.routes.extend(routes);
                }
                None => bindings.push(QueueBinding {
                    queue: descriptor.queue.clone(),
                    options: descriptor.queue_options.clone(),
                    routes: routes.collect(),
                }),
            }
        }

        bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(name: &'static str) -> Arc<dyn MessageHandler> {
        handler_fn(name, |_message| async { Ok::<_, SyncError>(Outcome::Ack) })
    }

    struct Owner {
        descriptors: Vec<SubscriptionDescriptor>,
    }

    impl Subscriber for Owner {
        fn subscriptions(self: Arc<Self>) -> Vec<SubscriptionDescriptor> {
            self.descriptors.clone()
        }
    }

    #[test]
    fn test_register_empty_owner() {
        let mut registry = SubscriptionRegistry::new();
        let descriptors = registry.register(Arc::new(Owner {
            descriptors: Vec::new(),
        }));
        assert!(descriptors.is_empty());
        assert!(registry.bindings().is_empty());
    }

    #[test]
    fn test_named_queues_are_grouped() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(Arc::new(Owner {
            descriptors: vec![
                SubscriptionDescriptor::new("amq.topic", handler("genre"))
                    .routing_key("model.genre.*")
                    .queue("genres"),
                SubscriptionDescriptor::new("amq.topic", handler("genre-relations"))
                    .routing_key("model.genre_categories.*")
                    .queue("genres"),
                SubscriptionDescriptor::new("amq.topic", handler("category"))
                    .routing_key("model.category.*")
                    .queue("categories"),
            ],
        }));

        let bindings = registry.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].queue, "genres");
        assert_eq!(bindings[0].routes.len(), 2);
        assert_eq!(bindings[1].queue, "categories");
    }

    #[test]
    fn test_duplicates_are_kept_and_first_options_win() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(Arc::new(Owner {
            descriptors: vec![
                SubscriptionDescriptor::new("amq.topic", handler("a"))
                    .routing_key("model.#")
                    .queue("q"),
                SubscriptionDescriptor::new("amq.topic", handler("b"))
                    .routing_key("model.#")
                    .queue("q")
                    .queue_options(QueueOptions::default().with_message_ttl(10)),
            ],
        }));

        let bindings = registry.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].routes.len(), 2);
        assert_eq!(bindings[0].options, QueueOptions::default());
    }

    #[test]
    fn test_exclusive_descriptors_stay_separate() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(Arc::new(Owner {
            descriptors: vec![
                SubscriptionDescriptor::new("amq.topic", handler("a")).routing_key("x.*"),
                SubscriptionDescriptor::new("amq.topic", handler("b")).routing_key("y.*"),
            ],
        }));

        let bindings = registry.bindings();
        assert_eq!(bindings.len(), 2);
        assert!(bindings.iter().all(|b| b.queue.is_empty() && b.options.exclusive));
    }

    #[test]
    fn test_handler_for_first_match_wins() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(Arc::new(Owner {
            descriptors: vec![SubscriptionDescriptor::new("amq.topic", handler("specific"))
                .routing_key("model.genre.*")
                .routing_key("model.#")
                .queue("q")],
        }));
        registry.register(Arc::new(Owner {
            descriptors: vec![SubscriptionDescriptor::new("amq.topic", handler("catch-all"))
                .routing_key("#")
                .queue("q")],
        }));

        let bindings = registry.bindings();
        let binding = &bindings[0];
        assert_eq!(binding.handler_for("model.genre.created").unwrap().pattern, "model.genre.*");
        assert_eq!(binding.handler_for("model.category.created").unwrap().pattern, "model.#");
        assert_eq!(binding.handler_for("other").unwrap().handler.name(), "catch-all");
        assert_eq!(registry.handler_count(), 2);
    }
}
