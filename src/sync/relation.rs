//! Embedded relation merges.
//!
//! A parent record embeds projected copies of related entities in an array
//! field (a genre embeds `{id, name, is_active}` of each of its categories).
//! A merge first loads every referenced entity; if any is missing the whole
//! merge fails and the parent is left untouched.

use super::{EventKind, SyncError, SyncEvent};
use crate::schema::project;
use crate::store::{record_id, Filter, MergeMode, Record, Store};
use serde_json::Value;
use tracing::{debug, info};

/// Payload key listing the related ids.
const RELATION_IDS: &str = "relation_ids";

/// A merge of related entities into a parent's embedded array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMergeRequest {
    pub parent_id: String,
    pub field: String,
    pub related_ids: Vec<String>,
    pub mode: MergeMode,
}

impl RelationMergeRequest {
    /// Build from a relation event: `attached` attaches, `updated` updates.
    ///
    /// Returns `Ok(None)` for relation events that carry no merge.
    pub fn from_event(event: &SyncEvent, field: &str) -> Result<Option<Self>, SyncError> {
        let mode = match event.kind {
            EventKind::Attached => MergeMode::Attach,
            EventKind::Updated => MergeMode::Update,
            EventKind::Created | EventKind::Deleted => return Ok(None),
        };

        let parent_id = event.require_id()?.to_string();

        let ids = match event.payload.get(RELATION_IDS) {
            Some(Value::Array(ids)) => ids,
            _ => {
                return Err(SyncError::malformed(
                    &event.routing_key,
                    format!("'{}' must be an array", RELATION_IDS),
                ))
            }
        };

        let mut related_ids = Vec::with_capacity(ids.len());
        for id in ids {
            let id = match id {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(SyncError::malformed(
                        &event.routing_key,
                        format!("invalid related id {}", other),
                    ))
                }
            };
            related_ids.push(id);
        }

        if related_ids.is_empty() {
            return Err(SyncError::malformed(
                &event.routing_key,
                format!("'{}' is empty", RELATION_IDS),
            ));
        }

        Ok(Some(Self {
            parent_id,
            field: field.to_string(),
            related_ids,
            mode,
        }))
    }
}

/// Load the related entities and merge them into the parent.
///
/// Returns the number of items merged.
pub async fn merge_relation(
    request: &RelationMergeRequest,
    parent: &dyn Store,
    related: &dyn Store,
) -> Result<usize, SyncError> {
    let relation = parent
        .schema()
        .relation_def(&request.field)
        .ok_or_else(|| SyncError::UnknownRelation {
            model: parent.model().to_string(),
            field: request.field.clone(),
        })?;

    let mut ids: Vec<String> = Vec::with_capacity(request.related_ids.len());
    for id in &request.related_ids {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }

    let found = related
        .find(&Filter::by_ids(ids.iter().cloned()).fields(&relation.fields))
        .await?;

    let found_ids: Vec<String> = found.iter().filter_map(record_id).collect();
    let missing: Vec<String> = ids
        .into_iter()
        .filter(|id| !found_ids.contains(id))
        .collect();
    if !missing.is_empty() {
        return Err(SyncError::RelatedNotFound {
            model: related.model().to_string(),
            missing,
        });
    }

    let merged = found.len();
    parent
        .merge_relation(&request.parent_id, &request.field, found, request.mode)
        .await?;

    debug!(
        model = %parent.model(),
        id = %request.parent_id,
        field = %request.field,
        mode = ?request.mode,
        items = merged,
        "Relation merged"
    );
    Ok(merged)
}

/// Refresh the embedded copy of `record` in every parent that embeds it.
///
/// Returns the number of parents refreshed.
pub async fn cascade_update(
    parent: &dyn Store,
    related_model: &str,
    record: &Record,
) -> Result<usize, SyncError> {
    let Some(id) = record_id(record) else {
        return Ok(0);
    };

    let mut refreshed = 0;
    for relation in parent.schema().relations_to(related_model) {
        let item = project(record, &relation.fields);
        let parents = parent
            .find(&Filter::embedding(relation.field.clone(), id.clone()).fields(&["id".to_string()]))
            .await?;

        for parent_record in parents {
            let Some(parent_id) = record_id(&parent_record) else {
                continue;
            };
            match parent
                .merge_relation(&parent_id, &relation.field, vec![item.clone()], MergeMode::Update)
                .await
            {
                Ok(()) => refreshed += 1,
                // Deleted since the lookup
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    if refreshed > 0 {
        info!(
            model = %parent.model(),
            related_model = %related_model,
            id = %id,
            parents = refreshed,
            "Refreshed embedded copies"
        );
    }
    Ok(refreshed)
}
