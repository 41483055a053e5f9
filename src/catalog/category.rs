use super::{log_applied, queue_name, routing_pattern, EXCHANGE};
use crate::broker::QueueOptions;
use crate::envelope::Message;
use crate::schema::{FieldDef, FieldKind, ModelSchema};
use crate::store::Store;
use crate::subscription::{handler_fn, Outcome, Subscriber, SubscriptionDescriptor};
use crate::sync::{cascade_update, reconcile, Applied, SyncError, SyncEvent};
use crate::validation::Validator;
use std::sync::Arc;
use tracing::warn;

pub const MODEL: &str = "category";

pub fn schema() -> ModelSchema {
    ModelSchema::new(MODEL)
        .field(FieldDef::new("id", FieldKind::String).required())
        .field(FieldDef::new("name", FieldKind::String).required().max_length(255))
        .field(FieldDef::new("description", FieldKind::String))
        .field(FieldDef::new("is_active", FieldKind::Boolean))
        .field(FieldDef::new("created_at", FieldKind::DateTime))
        .field(FieldDef::new("updated_at", FieldKind::DateTime))
}

/// Keeps categories in sync, and the category copies embedded in genres.
pub struct CategorySync {
    categories: Arc<dyn Store>,
    genres: Arc<dyn Store>,
    validator: Arc<dyn Validator>,
    queue_options: QueueOptions,
}

impl CategorySync {
    pub fn new(
        categories: Arc<dyn Store>,
        genres: Arc<dyn Store>,
        validator: Arc<dyn Validator>,
        queue_options: QueueOptions,
    ) -> Self {
        Self {
            categories,
            genres,
            validator,
            queue_options,
        }
    }

    pub async fn handle(&self, message: Message) -> Result<Outcome, SyncError> {
        let Some(event) = SyncEvent::from_message(MODEL, message.routing_key(), &message.data)? else {
            return Ok(Outcome::Ack);
        };
        if event.relation.is_some() {
            warn!(routing_key = %event.routing_key, "Category has no relations, ignoring");
            return Ok(Outcome::Ack);
        }

        let applied = reconcile(&event, self.categories.as_ref(), self.validator.as_ref()).await?;
        log_applied(&event, &applied);

        if let Applied::Updated(id) = &applied {
            if let Some(category) = self.categories.find_by_id(id).await? {
                cascade_update(self.genres.as_ref(), MODEL, &category).await?;
            }
        }
        Ok(Outcome::Ack)
    }
}

impl Subscriber for CategorySync {
    fn subscriptions(self: Arc<Self>) -> Vec<SubscriptionDescriptor> {
        let options = self.queue_options.clone();
        let owner = self;
        let handler = handler_fn("category-sync", move |message| {
            let owner = owner.clone();
            async move { owner.handle(message).await }
        });

        vec![SubscriptionDescriptor::new(EXCHANGE, handler)
            .routing_key(routing_pattern(MODEL))
            .queue(queue_name(MODEL))
            .queue_options(options)]
    }
}
