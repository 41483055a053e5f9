use super::{category, log_applied, queue_name, routing_pattern, EXCHANGE};
use crate::broker::QueueOptions;
use crate::envelope::Message;
use crate::schema::{FieldDef, FieldKind, ModelSchema, RelationDef};
use crate::store::Store;
use crate::subscription::{handler_fn, Outcome, Subscriber, SubscriptionDescriptor};
use crate::sync::{merge_relation, reconcile, RelationMergeRequest, SyncError, SyncEvent};
use crate::validation::Validator;
use std::sync::Arc;
use tracing::{info, warn};

pub const MODEL: &str = "genre";

/// Embedded array of category snapshots.
pub const CATEGORIES: &str = "categories";

pub fn schema() -> ModelSchema {
    ModelSchema::new(MODEL)
        .field(FieldDef::new("id", FieldKind::String).required())
        .field(FieldDef::new("name", FieldKind::String).required().max_length(255))
        .field(FieldDef::new("is_active", FieldKind::Boolean))
        .field(FieldDef::new("created_at", FieldKind::DateTime))
        .field(FieldDef::new("updated_at", FieldKind::DateTime))
        .relation(RelationDef::new(
            CATEGORIES,
            category::MODEL,
            ["id", "name", "is_active"],
        ))
}

/// Keeps genres and their embedded categories in sync.
pub struct GenreSync {
    genres: Arc<dyn Store>,
    categories: Arc<dyn Store>,
    validator: Arc<dyn Validator>,
    queue_options: QueueOptions,
}

impl GenreSync {
    pub fn new(
        genres: Arc<dyn Store>,
        categories: Arc<dyn Store>,
        validator: Arc<dyn Validator>,
        queue_options: QueueOptions,
    ) -> Self {
        Self {
            genres,
            categories,
            validator,
            queue_options,
        }
    }

    pub async fn handle(&self, message: Message) -> Result<Outcome, SyncError> {
        let Some(event) = SyncEvent::from_message(MODEL, message.routing_key(), &message.data)? else {
            return Ok(Outcome::Ack);
        };

        match event.relation.as_deref() {
            None => {
                let applied = reconcile(&event, self.genres.as_ref(), self.validator.as_ref()).await?;
                log_applied(&event, &applied);
            }
            Some(relation) => self.sync_relation(&event, relation).await?,
        }
        Ok(Outcome::Ack)
    }

    async fn sync_relation(&self, event: &SyncEvent, relation: &str) -> Result<(), SyncError> {
        let related = match relation {
            CATEGORIES => self.categories.as_ref(),
            _ => {
                return Err(SyncError::UnknownRelation {
                    model: MODEL.to_string(),
                    field: relation.to_string(),
                })
            }
        };

        let Some(request) = RelationMergeRequest::from_event(event, relation)? else {
            warn!(
                routing_key = %event.routing_key,
                event = %event.kind,
                "Relation event carries no merge, ignoring"
            );
            return Ok(());
        };

        let merged = merge_relation(&request, self.genres.as_ref(), related).await?;
        info!(
            model = MODEL,
            id = %request.parent_id,
            field = %request.field,
            items = merged,
            "Relation synchronized"
        );
        Ok(())
    }
}

impl Subscriber for GenreSync {
    fn subscriptions(self: Arc<Self>) -> Vec<SubscriptionDescriptor> {
        let options = self.queue_options.clone();
        let owner = self;
        let handler = handler_fn("genre-sync", move |message| {
            let owner = owner.clone();
            async move { owner.handle(message).await }
        });

        vec![SubscriptionDescriptor::new(EXCHANGE, handler)
            .routing_key(routing_pattern(MODEL))
            .routing_key(routing_pattern(&format!("{}_{}", MODEL, CATEGORIES)))
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
    use serde_json::{json, Value};

    async fn service() -> (GenreSync, Arc<MemoryStore>, Arc<MemoryStore>) {
        let genres = Arc::new(MemoryStore::new(schema()));
        let categories = Arc::new(MemoryStore::new(category::schema()));
        for (id, name) in [("c1", "Action"), ("c2", "Drama")] {
            let Value::Object(record) = json!({"id": id, "name": name, "is_active": true, "description": "-"}) else {
                unreachable!()
            };
            categories.create(record).await.unwrap();
        }
        let sync = GenreSync::new(
            genres.clone(),
            categories.clone(),
            Arc::new(SchemaValidator::new()),
            QueueOptions::default(),
        );
        (sync, genres, categories)
    }

    fn message(routing_key: &str, data: Value) -> Message {
        Message::from_envelope(Envelope::new(routing_key, data.to_string()))
    }

    #[tokio::test]
    async fn test_attach_categories() {
        let (sync, genres, _) = service().await;
        sync.handle(message("model.genre.created", json!({"id": "g1", "name": "Adventure"})))
            .await
            .unwrap();

        let attach = json!({"id": "g1", "relation_ids": ["c1", "c2"]});
        for _ in 0..2 {
            sync.handle(message("model.genre_categories.attached", attach.clone()))
                .await
                .unwrap();
        }

        let genre = genres.find_by_id("g1").await.unwrap().unwrap();
        assert_eq!(
            genre["categories"],
            json!([
                {"id": "c1", "name": "Action", "is_active": true},
                {"id": "c2", "name": "Drama", "is_active": true}
            ])
        );
    }

    #[tokio::test]
    async fn test_attach_missing_category_fails() {
        let (sync, genres, _) = service().await;
        sync.handle(message("model.genre.created", json!({"id": "g1", "name": "Adventure"})))
            .await
            .unwrap();

        let result = sync
            .handle(message(
                "model.genre_categories.attached",
                json!({"id": "g1", "relation_ids": ["c1", "c9"]}),
            ))
            .await;
        let error = result.unwrap_err();
        assert!(error.to_string().contains("related entities not found"));
        assert!(error.to_string().contains("c9"));

        let genre = genres.find_by_id("g1").await.unwrap().unwrap();
        assert!(!genre.contains_key("categories"));
    }

    #[tokio::test]
    async fn test_relation_created_is_ignored() {
        let (sync, genres, _) = service().await;
        let outcome = sync
            .handle(message("model.genre_categories.created", json!({"id": "g1"})))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ack);
        assert!(genres.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_relation() {
        let (sync, _, _) = service().await;
        let result = sync
            .handle(message("model.genre_cast_members.attached", json!({"id": "g1", "relation_ids": ["m1"]})))
            .await;
        assert!(matches!(result, Err(SyncError::UnknownRelation { .. })));
    }

    #[tokio::test]
    async fn test_updated_relation_refreshes_and_inserts() {
        let (sync, genres, categories) = service().await;
        sync.handle(message("model.genre.created", json!({"id": "g1", "name": "Adventure"})))
            .await
            .unwrap();
        sync.handle(message(
            "model.genre_categories.attached",
            json!({"id": "g1", "relation_ids": ["c1", "c2"]}),
        ))
        .await
        .unwrap();

        let Value::Object(renamed) = json!({"name": "Action & Adventure", "is_active": false}) else {
            unreachable!()
        };
        categories.update_by_id("c1", renamed).await.unwrap();
        let Value::Object(added) = json!({"id": "c3", "name": "Comedy", "is_active": true}) else {
            unreachable!()
        };
        categories.create(added).await.unwrap();

        let outcome = sync
            .handle(message(
                "model.genre_categories.updated",
                json!({"id": "g1", "relation_ids": ["c1", "c3"]}),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ack);

        let genre = genres.find_by_id("g1").await.unwrap().unwrap();
        assert_eq!(
            genre["categories"],
            json!([
                {"id": "c1", "name": "Action & Adventure", "is_active": false},
                {"id": "c2", "name": "Drama", "is_active": true},
                {"id": "c3", "name": "Comedy", "is_active": true}
            ])
        );
    }
}
