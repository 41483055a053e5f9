//! Redis-backed JSON document store.
//!
//! Each record is a JSON string under `{prefix}:{model}:{id}`; the set
//! `{prefix}:{model}:ids` indexes the ids of a model. Updates and relation
//! merges are optimistic read-modify-write transactions: `WATCH` the key, read
//! it, write it back in `MULTI`/`EXEC`, and start over if another writer got
//! there first.

use super::{ensure_id, merge_embedded, Filter, MergeMode, Record, Store, StoreError};
use crate::schema::ModelSchema;
use async_trait::async_trait;
use deadpool_redis::redis::{cmd, pipe, RedisError};
use deadpool_redis::{Connection, Pool};
use tracing::{debug, error, warn};

/// Give up after this many conflicting concurrent writes.
const MAX_TRANSACTION_RETRIES: usize = 16;

pub struct RedisStore {
    schema: ModelSchema,
    pool: Pool,
    prefix: String,
}

impl RedisStore {
    pub fn new(schema: ModelSchema, pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            schema,
            pool,
            prefix: prefix.into(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.schema.name, id)
    }

    fn index_key(&self) -> String {
        format!("{}:{}:ids", self.prefix, self.schema.name)
    }

    fn not_found(&self, id: &str) -> StoreError {
        StoreError::NotFound {
            model: self.schema.name.clone(),
            id: id.to_string(),
        }
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            StoreError::Backend(e.to_string())
        })
    }

    /// Read-modify-write one record under `WATCH`.
    async fn modify<F>(&self, id: &str, mut change: F) -> Result<(), StoreError>
    where
        F: FnMut(&mut Record) + Send,
    {
        let key = self.key(id);
        let mut conn = self.connection().await?;

        for attempt in 0..MAX_TRANSACTION_RETRIES {
            let _: () = cmd("WATCH")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

            let json = match self.read_changed(&mut conn, &key, id, &mut change).await {
                Ok(json) => json,
                Err(e) => {
                    // The connection goes back to the pool; it must not keep the watch
                    unwatch(&mut conn, &key).await;
                    return Err(e);
                }
            };

            // EXEC replies nil when the watched key changed
            let committed: Option<()> = pipe()
                .atomic()
                .cmd("SET")
                .arg(&key)
                .arg(&json)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

            if committed.is_some() {
                return Ok(());
            }
            debug!(key = %key, attempt = attempt + 1, "Concurrent write detected, retrying");
        }

        Err(StoreError::Backend(format!(
            "gave up writing '{}' after {} conflicting writes",
            key, MAX_TRANSACTION_RETRIES
        )))
    }

    /// GET the watched record and return it, changed, as JSON.
    async fn read_changed<F>(
        &self,
        conn: &mut Connection,
        key: &str,
        id: &str,
        change: F,
    ) -> Result<String, StoreError>
    where
        F: FnOnce(&mut Record) + Send,
    {
        let current: Option<String> = cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(backend)?;
        let current = current.ok_or_else(|| self.not_found(id))?;
        rewrite(&current, change)
    }
}

/// Apply `change` to a stored JSON document.
fn rewrite<F>(current: &str, change: F) -> Result<String, StoreError>
where
    F: FnOnce(&mut Record),
{
    let mut record: Record = serde_json::from_str(current)?;
    change(&mut record);
    Ok(serde_json::to_string(&record)?)
}

async fn unwatch(conn: &mut Connection, key: &str) {
    let result: Result<(), RedisError> = cmd("UNWATCH").query_async(&mut *conn).await;
    if let Err(e) = result {
        warn!(key = %key, error = %e, "UNWATCH failed");
    }
}

fn backend(e: RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl Store for RedisStore {
    fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let mut conn = self.connection().await?;

        let ids: Vec<String> = match &filter.ids {
            Some(ids) => ids.clone(),
            None => cmd("SMEMBERS")
                .arg(self.index_key())
                .query_async(&mut conn)
                .await
                .map_err(backend)?,
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.key(id)).collect();
        let documents: Vec<Option<String>> = cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let mut found = Vec::new();
        for document in documents.into_iter().flatten() {
            let record: Record = serde_json::from_str(&document)?;
            if filter.matches(&record) {
                found.push(filter.project(record));
            }
        }
        Ok(found)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let count: i64 = cmd("EXISTS")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }

    async fn create(&self, record: Record) -> Result<Record, StoreError> {
        let (record, id) = ensure_id(&self.schema.name, record)?;
        let json = serde_json::to_string(&record)?;
        let mut conn = self.connection().await?;

        let (stored,): (Option<String>,) = pipe()
            .atomic()
            .cmd("SET")
            .arg(self.key(&id))
            .arg(&json)
            .arg("NX")
            .cmd("SADD")
            .arg(self.index_key())
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        match stored {
            Some(_) => Ok(record),
            None => Err(StoreError::Conflict {
                model: self.schema.name.clone(),
                id,
            }),
        }
    }

    async fn update_by_id(&self, id: &str, partial: Record) -> Result<(), StoreError> {
        self.modify(id, |record| {
            for (key, value) in &partial {
                if key != "id" {
                    record.insert(key.clone(), value.clone());
                }
            }
        })
        .await
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let (removed,): (i64,) = pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.key(id))
            .cmd("SREM")
            .arg(self.index_key())
            .arg(id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        if removed == 0 {
            return Err(self.not_found(id));
        }
        Ok(())
    }

    async fn merge_relation(
        &self,
        id: &str,
        field: &str,
        items: Vec<Record>,
        mode: MergeMode,
    ) -> Result<(), StoreError> {
        self.modify(id, |record| {
            merge_embedded(record, field, items.clone(), mode);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_redis::{Config, Runtime};

    fn store() -> RedisStore {
        // Pool creation is lazy; no server is contacted
        let pool = Config::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        RedisStore::new(ModelSchema::new("cast_member"), pool, "catalog")
    }

    #[tokio::test]
    async fn test_keys() {
        let store = store();
        assert_eq!(store.key("m1"), "catalog:cast_member:m1");
        assert_eq!(store.index_key(), "catalog:cast_member:ids");
        assert_eq!(store.model(), "cast_member");
    }

    #[test]
    fn test_rewrite_applies_change() {
        let json = rewrite(r#"{"id":"g1","name":"Drama"}"#, |record| {
            record.insert("name".to_string(), serde_json::json!("Comedy"));
        })
        .unwrap();
        let record: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record["name"], "Comedy");
    }

    #[test]
    fn test_rewrite_rejects_corrupt_document() {
        let mut called = false;
        let result = rewrite("{not json", |_| called = true);
        assert!(matches!(result, Err(StoreError::Serialization(_))));
        assert!(!called);
    }
}
