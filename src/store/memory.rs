//! In-memory store.

use super::{ensure_id, merge_embedded, Filter, MergeMode, Record, Store, StoreError};
use crate::schema::ModelSchema;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Records of one model in a `BTreeMap`, ordered by id.
pub struct MemoryStore {
    schema: ModelSchema,
    records: RwLock<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new(schema: ModelSchema) -> Self {
        Self {
            schema,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn not_found(&self, id: &str) -> StoreError {
        StoreError::NotFound {
            model: self.schema.name.clone(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let records = self.records.read().await;
        let found = match &filter.ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| records.get(id))
                .filter(|r| filter.matches(r))
                .cloned()
                .map(|r| filter.project(r))
                .collect(),
            None => records
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .map(|r| filter.project(r))
                .collect(),
        };
        Ok(found)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(id))
    }

    async fn create(&self, record: Record) -> Result<Record, StoreError> {
        let (record, id) = ensure_id(&self.schema.name, record)?;
        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Err(StoreError::Conflict {
                model: self.schema.name.clone(),
                id,
            });
        }
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn update_by_id(&self, id: &str, partial: Record) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| self.not_found(id))?;
        for (key, value) in partial {
            // The id is the key; never rewrite it
            if key != "id" {
                record.insert(key, value);
            }
        }
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.not_found(id))
    }

    async fn merge_relation(
        &self,
        id: &str,
        field: &str,
        items: Vec<Record>,
        mode: MergeMode,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| self.not_found(id))?;
        merge_embedded(record, field, items, mode);
        Ok(())
    }
}
