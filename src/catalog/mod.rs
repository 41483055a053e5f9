//! Catalog models and their sync services.
//!
//! Each model gets a schema, a store and a sync service that subscribes to
//! the model's events on `amq.topic`:
//!
//! | model         | queue                                    | routing keys                                   |
//! |---------------|------------------------------------------|------------------------------------------------|
//! | `category`    | `micro-catalog/sync-videos/category`     | `model.category.*`                             |
//! | `genre`       | `micro-catalog/sync-videos/genre`        | `model.genre.*`, `model.genre_categories.*`    |
//! | `cast_member` | `micro-catalog/sync-videos/cast_member`  | `model.cast_member.*`                          |

pub mod cast_member;
pub mod category;
pub mod genre;

use crate::broker::QueueOptions;
use crate::store::{MemoryStore, RedisStore, Store};
use crate::subscription::SubscriptionRegistry;
use crate::sync::{Applied, SyncEvent};
use crate::validation::Validator;
use deadpool_redis::Pool;
use std::sync::Arc;
use tracing::{debug, info};

pub use cast_member::CastMemberSync;
pub use category::CategorySync;
pub use genre::GenreSync;

/// Exchange the upstream services publish model events to.
pub const EXCHANGE: &str = "amq.topic";

/// First routing key segment of every model event.
pub const EVENT_PREFIX: &str = "model";

const QUEUE_PREFIX: &str = "micro-catalog/sync-videos";

/// Queue consumed by the sync service of `model`.
pub fn queue_name(model: &str) -> String {
    format!("{}/{}", QUEUE_PREFIX, model)
}

/// `model.<subject>.*`
pub fn routing_pattern(subject: &str) -> String {
    format!("{}.{}.*", EVENT_PREFIX, subject)
}

/// One store per catalog model.
#[derive(Clone)]
pub struct CatalogStores {
    pub categories: Arc<dyn Store>,
    pub genres: Arc<dyn Store>,
    pub cast_members: Arc<dyn Store>,
}

impl CatalogStores {
    pub fn in_memory() -> Self {
        Self {
            categories: Arc::new(MemoryStore::new(category::schema())),
            genres: Arc::new(MemoryStore::new(genre::schema())),
            cast_members: Arc::new(MemoryStore::new(cast_member::schema())),
        }
    }

    /// Redis stores sharing one pool, keys under `prefix`.
    pub fn redis(pool: Pool, prefix: &str) -> Self {
        Self {
            categories: Arc::new(RedisStore::new(category::schema(), pool.clone(), prefix)),
            genres: Arc::new(RedisStore::new(genre::schema(), pool.clone(), prefix)),
            cast_members: Arc::new(RedisStore::new(cast_member::schema(), pool, prefix)),
        }
    }
}

/// Wires the sync services to their stores and the validator.
pub struct Catalog {
    stores: CatalogStores,
    validator: Arc<dyn Validator>,
    queue_options: QueueOptions,
}

impl Catalog {
    pub fn new(stores: CatalogStores, validator: Arc<dyn Validator>) -> Self {
        Self {
            stores,
            validator,
            queue_options: QueueOptions::default(),
        }
    }

    /// Options for every sync queue (dead-lettering, TTL).
    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    pub fn stores(&self) -> &CatalogStores {
        &self.stores
    }

    /// Register every sync service.
    pub fn register(&self, registry: &mut SubscriptionRegistry) {
        let options = &self.queue_options;

        registry.register(Arc::new(CategorySync::new(
            self.stores.categories.clone(),
            self.stores.genres.clone(),
            self.validator.clone(),
            options.clone(),
        )));
        registry.register(Arc::new(GenreSync::new(
            self.stores.genres.clone(),
            self.stores.categories.clone(),
            self.validator.clone(),
            options.clone(),
        )));
        registry.register(Arc::new(CastMemberSync::new(
            self.stores.cast_members.clone(),
            self.validator.clone(),
            options.clone(),
        )));

        info!(subscriptions = registry.handler_count(), "Catalog sync services registered");
    }
}

fn log_applied(event: &SyncEvent, applied: &Applied) {
    match applied {
        Applied::Created(id) | Applied::Updated(id) | Applied::Deleted(id) => info!(
            model = %event.model,
            id = %id,
            event = %event.kind,
            result = ?applied,
            "Entity synchronized"
        ),
        Applied::AlreadyAbsent(id) => debug!(
            model = %event.model,
            id = %id,
            "Deleted entity was already absent"
        ),
        Applied::Skipped => debug!(
            model = %event.model,
            routing_key = %event.routing_key,
            "Nothing to apply"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::SchemaValidator;

    #[test]
    fn test_names() {
        assert_eq!(queue_name("cast_member"), "micro-catalog/sync-videos/cast_member");
        assert_eq!(routing_pattern("genre_categories"), "model.genre_categories.*");
    }

    #[test]
    fn test_register_builds_one_binding_per_model() {
        let catalog = Catalog::new(CatalogStores::in_memory(), Arc::new(SchemaValidator::new()));
        let mut registry = SubscriptionRegistry::new();
        catalog.register(&mut registry);

        let bindings = registry.bindings();
        let queues: Vec<&str> = bindings.iter().map(|b| b.queue.as_str()).collect();
        assert_eq!(
            queues,
            vec![
                "micro-catalog/sync-videos/category",
                "micro-catalog/sync-videos/genre",
                "micro-catalog/sync-videos/cast_member",
            ]
        );

        let genre = &bindings[1];
        assert!(genre.handler_for("model.genre.created").is_some());
        assert!(genre.handler_for("model.genre_categories.attached").is_some());
        assert!(genre.handler_for("model.category.created").is_none());
        assert!(genre.routes.iter().all(|r| r.exchange == EXCHANGE));
    }
}
