use super::{log_applied, queue_name, routing_pattern, EXCHANGE};
use crate::broker::QueueOptions;
use crate::envelope::Message;
use crate::schema::{FieldDef, FieldKind, ModelSchema};
use crate::store::Store;
use crate::subscription::{handler_fn, Outcome, Subscriber, SubscriptionDescriptor};
use crate::sync::{reconcile, SyncError, SyncEvent};
use crate::validation::Validator;
use serde_json::json;
use std::sync::Arc;

pub const MODEL: &str = "cast_member";

/// `type` values
pub const TYPE_DIRECTOR: i64 = 1;
pub const TYPE_ACTOR: i64 = 2;

pub fn schema() -> ModelSchema {
    ModelSchema::new(MODEL)
        .field(FieldDef::new("id", FieldKind::String).required())
        .field(FieldDef::new("name", FieldKind::String).required().max_length(255))
        .field(
            FieldDef::new("type", FieldKind::Integer)
                .required()
                .one_of([json!(TYPE_DIRECTOR), json!(TYPE_ACTOR)]),
        )
        .field(FieldDef::new("created_at", FieldKind::DateTime))
        .field(FieldDef::new("updated_at", FieldKind::DateTime))
}

pub struct CastMemberSync {
    cast_members: Arc<dyn Store>,
    validator: Arc<dyn Validator>,
    queue_options: QueueOptions,
}

impl CastMemberSync {
    pub fn new(cast_members: Arc<dyn Store>, validator: Arc<dyn Validator>, queue_options: QueueOptions) -> Self {
        Self {
            cast_members,
            validator,
            queue_options,
        }
    }

    pub async fn handle(&self, message: Message) -> Result<Outcome, SyncError> {
        let Some(event) = SyncEvent::from_message(MODEL, message.routing_key(), &message.data)? else {
            return Ok(Outcome::Ack);
        };
        let applied = reconcile(&event, self.cast_members.as_ref(), self.validator.as_ref()).await?;
        log_applied(&event, &applied);
        Ok(Outcome::Ack)
    }
}

impl Subscriber for CastMemberSync {
    fn subscriptions(self: Arc<Self>) -> Vec<SubscriptionDescriptor> {
        let options = self.queue_options.clone();
        let owner = self;
        let handler = handler_fn("cast-member-sync", move |message| {
            let owner = owner.clone();
            async move { owner.handle(message).await }
        });

        vec![SubscriptionDescriptor::new(EXCHANGE, handler)
            .routing_key(routing_pattern(MODEL))
            .queue(queue_name(MODEL))
            .queue_options(options)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::store::MemoryStore;
    use crate::validation::SchemaValidator;
    use serde_json::Value;

    fn message(routing_key: &str, data: Value) -> Message {
        Message::from_envelope(Envelope::new(routing_key, data.to_string()))
    }

    #[tokio::test]
    async fn test_type_is_restricted() {
        let store = Arc::new(MemoryStore::new(schema()));
        let sync = CastMemberSync::new(store.clone(), Arc::new(SchemaValidator::new()), QueueOptions::default());

        sync.handle(message("model.cast_member.created", json!({"id": "m1", "name": "Ana", "type": 2})))
            .await
            .unwrap();
        assert!(store.exists("m1").await.unwrap());

        let invalid = sync
            .handle(message("model.cast_member.created", json!({"id": "m2", "name": "Bo", "type": 3})))
            .await;
        assert!(matches!(invalid, Err(SyncError::Validation(_))));
        assert!(!store.exists("m2").await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let store = Arc::new(MemoryStore::new(schema()));
        let sync = CastMemberSync::new(store, Arc::new(SchemaValidator::new()), QueueOptions::default());

        let envelope = Envelope::new("model.cast_member.created", "not json");
        let result = sync.handle(Message::from_envelope(envelope)).await;
        assert!(matches!(result, Err(SyncError::MalformedEvent { .. })));
    }
}
