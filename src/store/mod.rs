//! Entity stores.
//!
//! A [`Store`] holds the records of one model, keyed by their `id` field.
//! Stores know their [`ModelSchema`] so that callers can filter payloads and
//! resolve relation projections without a separate registry.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: `RwLock`-guarded map, used by tests and local runs
//! - [`RedisStore`]: JSON documents in Redis with optimistic
//!   `WATCH`/`MULTI` read-modify-write for updates and merges

pub mod memory;
pub mod redis;

use crate::schema::{project, ModelSchema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// A stored entity: a JSON object with an `id`.
pub type Record = Map<String, Value>;

/// Errors raised by a store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{model} '{id}' not found")]
    NotFound { model: String, id: String },

    #[error("{model} '{id}' already exists")]
    Conflict { model: String, id: String },

    #[error("{model} record has no usable id")]
    MissingId { model: String },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// How a relation merge treats the parent's embedded array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Add items whose id is not present yet
    Attach,
    /// Replace the item with the same id, or add it
    Update,
}

/// Selection and projection for [`Store::find`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Only these ids (`None` = every record)
    pub ids: Option<Vec<String>>,
    /// Only these fields (`None` = whole records)
    pub fields: Option<Vec<String>>,
    /// Only records whose array `field` holds an item with this id
    pub embedding: Option<(String, String)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Records embedding related entity `id` in `field`.
    pub fn embedding(field: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            embedding: Some((field.into(), id.into())),
            ..Self::default()
        }
    }

    pub fn fields(mut self, fields: &[String]) -> Self {
        self.fields = Some(fields.to_vec());
        self
    }

    /// Whether `record` satisfies the selection part of the filter.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(ids) = &self.ids {
            match record_id(record) {
                Some(id) if ids.contains(&id) => {}
                _ => return false,
            }
        }

        if let Some((field, id)) = &self.embedding {
            let embedded = record
                .get(field)
                .and_then(Value::as_array)
                .map(|items| items.iter().any(|item| item_id(item).as_deref() == Some(id.as_str())))
                .unwrap_or(false);
            if !embedded {
                return false;
            }
        }

        true
    }

    /// Apply the projection part of the filter.
    pub fn project(&self, record: Record) -> Record {
        match &self.fields {
            Some(fields) => project(&record, fields),
            None => record,
        }
    }
}

/// Id of a record as a string. Numeric ids are accepted.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

fn item_id(item: &Value) -> Option<String> {
    item.as_object().and_then(record_id)
}

/// Merge `items` into the array at `field` of `record`.
///
/// A missing or non-array field starts out empty. Items without an id are
/// ignored.
pub fn merge_embedded(record: &mut Record, field: &str, items: Vec<Record>, mode: MergeMode) {
    let slot = record
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    let Value::Array(existing) = slot else {
        return;
    };

    for item in items {
        let Some(id) = record_id(&item) else {
            continue;
        };
        let position = existing
            .iter()
            .position(|e| item_id(e).as_deref() == Some(id.as_str()));

        match (position, mode) {
            (Some(_), MergeMode::Attach) => {}
            (Some(index), MergeMode::Update) => existing[index] = Value::Object(item),
            (None, _) => existing.push(Value::Object(item)),
        }
    }
}

/// Storage for one model's records.
#[async_trait]
pub trait Store: Send + Sync {
    fn schema(&self) -> &ModelSchema;

    fn model(&self) -> &str {
        &self.schema().name
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Record>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.find(&Filter::by_ids([id])).await?.into_iter().next())
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Insert a new record. A record without an id gets a generated one.
    async fn create(&self, record: Record) -> Result<Record, StoreError>;

    /// Shallow-merge `partial` into an existing record.
    async fn update_by_id(&self, id: &str, partial: Record) -> Result<(), StoreError>;

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;

    /// Atomically merge `items` into the embedded array `field` of record `id`.
    async fn merge_relation(
        &self,
        id: &str,
        field: &str,
        items: Vec<Record>,
        mode: MergeMode,
    ) -> Result<(), StoreError>;
}

/// Give a record an id if it has none.
pub(crate) fn ensure_id(model: &str, mut record: Record) -> Result<(Record, String), StoreError> {
    match record.get("id") {
        None | Some(Value::Null) => {
            let id = uuid::Uuid::new_v4().to_string();
            record.insert("id".to_string(), Value::String(id.clone()));
            Ok((record, id))
        }
        Some(_) => match record_id(&record) {
            Some(id) => Ok((record, id)),
            None => Err(StoreError::MissingId {
                model: model.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    #[test]
    fn test_attach_is_union_by_id() {
        let mut genre = record(json!({"id": "g1", "categories": [{"id": "c1", "name": "Old"}]}));
        let items = vec![
            record(json!({"id": "c1", "name": "New"})),
            record(json!({"id": "c2", "name": "Drama"})),
        ];

        merge_embedded(&mut genre, "categories", items.clone(), MergeMode::Attach);
        merge_embedded(&mut genre, "categories", items, MergeMode::Attach);

        assert_eq!(
            genre["categories"],
            json!([{"id": "c1", "name": "Old"}, {"id": "c2", "name": "Drama"}])
        );
    }

    #[test]
    fn test_update_replaces_or_inserts() {
        let mut genre = record(json!({"id": "g1", "categories": [{"id": "c1", "name": "Old"}]}));
        merge_embedded(
            &mut genre,
            "categories",
            vec![record(json!({"id": "c1", "name": "New"})), record(json!({"id": "c3"}))],
            MergeMode::Update,
        );
        assert_eq!(genre["categories"], json!([{"id": "c1", "name": "New"}, {"id": "c3"}]));
    }

    #[test]
    fn test_merge_into_missing_or_invalid_field() {
        let mut genre = record(json!({"id": "g1", "categories": "oops"}));
        merge_embedded(&mut genre, "categories", vec![record(json!({"id": "c1"}))], MergeMode::Attach);
        assert_eq!(genre["categories"], json!([{"id": "c1"}]));

        let mut bare = record(json!({"id": "g2"}));
        merge_embedded(&mut bare, "categories", vec![record(json!({"name": "no id"}))], MergeMode::Attach);
        assert_eq!(bare["categories"], json!([]));
    }

    #[test]
    fn test_filter_matches() {
        let genre = record(json!({"id": "g1", "categories": [{"id": "c1"}]}));
        assert!(Filter::all().matches(&genre));
        assert!(Filter::by_ids(["g1", "g2"]).matches(&genre));
        assert!(!Filter::by_ids(["g2"]).matches(&genre));
        assert!(Filter::embedding("categories", "c1").matches(&genre));
        assert!(!Filter::embedding("categories", "c2").matches(&genre));
    }

    #[test]
    fn test_ensure_id() {
        let (generated, id) = ensure_id("category", Record::new()).unwrap();
        assert_eq!(generated["id"], json!(id));

        let (_, numeric) = ensure_id("category", record(json!({"id": 7}))).unwrap();
        assert_eq!(numeric, "7");

        let invalid = ensure_id("category", record(json!({"id": ""})));
        assert!(matches!(invalid, Err(StoreError::MissingId { .. })));
    }
}
