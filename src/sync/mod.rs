//! Event reconciliation.
//!
//! Upstream services publish one event per entity change:
//!
//! ```text
//! model.category.created            {"id": "c1", "name": "Action", ...}
//! model.category.updated            {"id": "c1", "name": "Action!"}
//! model.category.deleted            {"id": "c1"}
//! model.genre_categories.attached   {"id": "g1", "relation_ids": ["c1", "c2"]}
//! ```
//!
//! [`SyncEvent::from_message`] parses the routing key and payload against the
//! model a handler serves, and [`reconcile`] applies entity events to a
//! [`Store`]. Every operation is idempotent under redelivery except a repeated
//! `created`, which the store rejects as a conflict.

pub mod relation;

use crate::store::{record_id, Store, StoreError};
use crate::validation::{ValidateOptions, ValidationError, Validator};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub use relation::{cascade_update, merge_relation, RelationMergeRequest};

/// Errors returned by message handlers.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("malformed event '{routing_key}': {reason}")]
    MalformedEvent { routing_key: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("related entities not found: {model} [{}]", .missing.join(", "))]
    RelatedNotFound { model: String, missing: Vec<String> },

    #[error("{model} has no relation '{field}'")]
    UnknownRelation { model: String, field: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Handler(String),
}

impl SyncError {
    fn malformed(routing_key: &str, reason: impl Into<String>) -> Self {
        SyncError::MalformedEvent {
            routing_key: routing_key.to_string(),
            reason: reason.into(),
        }
    }
}

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Attached,
}

impl EventKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "created" => Some(EventKind::Created),
            "updated" => Some(EventKind::Updated),
            "deleted" => Some(EventKind::Deleted),
            "attached" => Some(EventKind::Attached),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Attached => "attached",
        }
    }

    fn needs_id(&self) -> bool {
        !matches!(self, EventKind::Created)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    pub routing_key: String,
    pub model: String,
    /// Relation name for `<model>_<relation>` subjects
    pub relation: Option<String>,
    pub kind: EventKind,
    pub id: Option<String>,
    /// The payload object
    pub payload: Value,
}

impl SyncEvent {
    /// Parse `<prefix>.<subject>.<kind>` for a handler serving `model`.
    ///
    /// Returns `Ok(None)` for kinds this service does not handle.
    pub fn from_message(model: &str, routing_key: &str, data: &Value) -> Result<Option<Self>, SyncError> {
        let segments: Vec<&str> = routing_key.split('.').collect();
        if segments.len() < 3 {
            return Err(SyncError::malformed(
                routing_key,
                "expected <prefix>.<model>.<event>",
            ));
        }

        let subject = segments[1..segments.len() - 1].join(".");
        let relation = if subject == model {
            None
        } else {
            match subject.strip_prefix(model).and_then(|rest| rest.strip_prefix('_')) {
                Some(relation) if !relation.is_empty() => Some(relation.to_string()),
                _ => {
                    return Err(SyncError::malformed(
                        routing_key,
                        format!("subject '{}' does not belong to model '{}'", subject, model),
                    ))
                }
            }
        };

        let raw_kind = segments[segments.len() - 1];
        let Some(kind) = EventKind::parse(raw_kind) else {
            debug!(routing_key = %routing_key, kind = %raw_kind, "Ignoring unknown event kind");
            return Ok(None);
        };

        let Value::Object(payload) = data else {
            return Err(SyncError::malformed(routing_key, "payload is not a JSON object"));
        };

        let id = record_id(payload);
        if kind.needs_id() && id.is_none() {
            return Err(SyncError::malformed(
                routing_key,
                format!("{} event without an id", kind),
            ));
        }

        Ok(Some(Self {
            routing_key: routing_key.to_string(),
            model: model.to_string(),
            relation,
            kind,
            id,
            payload: data.clone(),
        }))
    }

    fn require_id(&self) -> Result<&str, SyncError> {
        self.id
            .as_deref()
            .ok_or_else(|| SyncError::malformed(&self.routing_key, "event without an id"))
    }
}

/// What [`reconcile`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Created(String),
    Updated(String),
    Deleted(String),
    /// Delete of an entity that was not there
    AlreadyAbsent(String),
    /// Nothing to do for this event kind
    Skipped,
}

/// Apply an entity event to `store`.
///
/// - `created`: declared fields only, full validation, insert
/// - `updated`: partial update when the entity exists, create otherwise
/// - `deleted`: delete, a missing entity counts as done
pub async fn reconcile(
    event: &SyncEvent,
    store: &dyn Store,
    validator: &dyn Validator,
) -> Result<Applied, SyncError> {
    let schema = store.schema();
    let record = schema.pick(&event.payload);

    match event.kind {
        EventKind::Created => {
            validator
                .validate(&record, schema, ValidateOptions::full())
                .await?;
            let created = store.create(record).await?;
            Ok(Applied::Created(record_id(&created).unwrap_or_default()))
        }
        EventKind::Updated => {
            let id = event.require_id()?;
            if store.exists(id).await? {
                validator
                    .validate(&record, schema, ValidateOptions::partial())
                    .await?;
                store.update_by_id(id, record).await?;
                Ok(Applied::Updated(id.to_string()))
            } else {
                debug!(model = %schema.name, id = %id, "Update for unknown entity, creating it");
                validator
                    .validate(&record, schema, ValidateOptions::full())
                    .await?;
                store.create(record).await?;
                Ok(Applied::Created(id.to_string()))
            }
        }
        EventKind::Deleted => {
            let id = event.require_id()?;
            match store.delete_by_id(id).await {
                Ok(()) => Ok(Applied::Deleted(id.to_string())),
                Err(e) if e.is_not_found() => Ok(Applied::AlreadyAbsent(id.to_string())),
                Err(e) => Err(e.into()),
            }
        }
        EventKind::Attached => Ok(Applied::Skipped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldKind, ModelSchema};
    use crate::store::{Filter, MemoryStore};
    use crate::validation::SchemaValidator;
    use serde_json::json;

    fn categories() -> MemoryStore {
        MemoryStore::new(
            ModelSchema::new("category")
                .field(FieldDef::new("id", FieldKind::String).required())
                .field(FieldDef::new("name", FieldKind::String).required())
                .field(FieldDef::new("is_active", FieldKind::Boolean)),
        )
    }

    fn event(model: &str, routing_key: &str, data: Value) -> SyncEvent {
        SyncEvent::from_message(model, routing_key, &data).unwrap().unwrap()
    }

    #[test]
    fn test_parse_entity_event() {
        let event = event("category", "model.category.created", json!({"id": "c1"}));
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.relation, None);
        assert_eq!(event.id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_parse_model_with_underscore() {
        let event = event("cast_member", "model.cast_member.deleted", json!({"id": "m1"}));
        assert_eq!(event.model, "cast_member");
        assert_eq!(event.relation, None);
    }

    #[test]
    fn test_parse_relation_event() {
        let event = event(
            "genre",
            "model.genre_categories.attached",
            json!({"id": "g1", "relation_ids": ["c1"]}),
        );
        assert_eq!(event.relation.as_deref(), Some("categories"));
        assert_eq!(event.kind, EventKind::Attached);
    }

    #[test]
    fn test_parse_errors() {
        let short = SyncEvent::from_message("category", "model.category", &json!({}));
        assert!(matches!(short, Err(SyncError::MalformedEvent { .. })));

        let foreign = SyncEvent::from_message("category", "model.genre.created", &json!({}));
        assert!(matches!(foreign, Err(SyncError::MalformedEvent { .. })));

        let null = SyncEvent::from_message("category", "model.category.created", &Value::Null);
        assert!(matches!(null, Err(SyncError::MalformedEvent { .. })));

        let no_id = SyncEvent::from_message("category", "model.category.deleted", &json!({"name": "x"}));
        assert!(matches!(no_id, Err(SyncError::MalformedEvent { .. })));
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let parsed = SyncEvent::from_message("category", "model.category.restored", &json!({"id": "c1"}));
        assert!(matches!(parsed, Ok(None)));
    }

    #[tokio::test]
    async fn test_created_persists_declared_fields_only() {
        let store = categories();
        let validator = SchemaValidator::new();
        let created = event(
            "category",
            "model.category.created",
            json!({"id": "c1", "name": "Action", "unknown": true}),
        );

        let applied = reconcile(&created, &store, &validator).await.unwrap();
        assert_eq!(applied, Applied::Created("c1".to_string()));

        let stored = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(Value::Object(stored), json!({"id": "c1", "name": "Action"}));
    }

    #[tokio::test]
    async fn test_created_twice_conflicts() {
        let store = categories();
        let validator = SchemaValidator::new();
        let created = event("category", "model.category.created", json!({"id": "c1", "name": "A"}));

        reconcile(&created, &store, &validator).await.unwrap();
        let replay = reconcile(&created, &store, &validator).await;
        assert!(matches!(replay, Err(SyncError::Store(StoreError::Conflict { .. }))));
    }

    #[tokio::test]
    async fn test_updated_missing_is_created() {
        let store = categories();
        let validator = SchemaValidator::new();
        let updated = event("category", "model.category.updated", json!({"id": "c2", "name": "Drama"}));

        let applied = reconcile(&updated, &store, &validator).await.unwrap();
        assert_eq!(applied, Applied::Created("c2".to_string()));
        assert!(store.exists("c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_updated_missing_requires_full_record() {
        let store = categories();
        let validator = SchemaValidator::new();
        let updated = event("category", "model.category.updated", json!({"id": "c2"}));

        let result = reconcile(&updated, &store, &validator).await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert!(!store.exists("c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_updated_existing_is_partial() {
        let store = categories();
        let validator = SchemaValidator::new();
        reconcile(
            &event("category", "model.category.created", json!({"id": "c1", "name": "Action", "is_active": true})),
            &store,
            &validator,
        )
        .await
        .unwrap();

        let applied = reconcile(
            &event("category", "model.category.updated", json!({"id": "c1", "is_active": false})),
            &store,
            &validator,
        )
        .await
        .unwrap();
        assert_eq!(applied, Applied::Updated("c1".to_string()));

        let stored = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(stored["name"], "Action");
        assert_eq!(stored["is_active"], false);
    }

    #[tokio::test]
    async fn test_deleted_regardless_of_existence() {
        let store = categories();
        let validator = SchemaValidator::new();
        let deleted = event("category", "model.category.deleted", json!({"id": "c1"}));

        let applied = reconcile(&deleted, &store, &validator).await.unwrap();
        assert_eq!(applied, Applied::AlreadyAbsent("c1".to_string()));

        reconcile(
            &event("category", "model.category.created", json!({"id": "c1", "name": "A"})),
            &store,
            &validator,
        )
        .await
        .unwrap();
        let applied = reconcile(&deleted, &store, &validator).await.unwrap();
        assert_eq!(applied, Applied::Deleted("c1".to_string()));
        assert!(store.find(&Filter::all()).await.unwrap().is_empty());
    }
}
