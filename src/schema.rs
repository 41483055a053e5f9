//! Model schemas.
//!
//! A [`ModelSchema`] declares which fields a model persists, their kinds and
//! constraints, and which fields embed copies of related models. The sync
//! engine uses it to filter incoming payloads down to declared fields, the
//! validator to check them, and the relation engine to know which fields of a
//! related entity to embed.

use crate::store::Record;
use serde::Serialize;
use serde_json::Value;

/// JSON kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// RFC 3339 timestamp string
    DateTime,
    Array,
    Object,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::DateTime => "date-time",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }

    /// Whether `value` has this kind. Date-time strings are only shape-checked here.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String | FieldKind::DateTime => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            allowed: Vec::new(),
            max_length: None,
            pattern: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Restrict the value to a fixed set.
    pub fn one_of(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.allowed = values.into_iter().collect();
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Regex a string value must match.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// An array field holding projected copies of another model's entities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationDef {
    /// Embedded array field on the parent
    pub field: String,
    /// Related model name
    pub model: String,
    /// Fields of the related entity copied into each item
    pub fields: Vec<String>,
}

impl RelationDef {
    pub fn new(
        field: impl Into<String>,
        model: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            field: field.into(),
            model: model.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSchema {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Declare a relation. The embedded array field is declared with it.
    pub fn relation(mut self, relation: RelationDef) -> Self {
        if !self.has_field(&relation.field) {
            self.fields
                .push(FieldDef::new(relation.field.clone(), FieldKind::Array));
        }
        self.relations.push(relation);
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation_def(&self, field: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.field == field)
    }

    /// Relations that embed `model`.
    pub fn relations_to<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a RelationDef> {
        self.relations.iter().filter(move |r| r.model == model)
    }

    /// Keep only declared fields of a JSON object.
    pub fn pick(&self, data: &Value) -> Record {
        let mut record = Record::new();
        if let Value::Object(map) = data {
            for field in &self.fields {
                if let Some(value) = map.get(&field.name) {
                    record.insert(field.name.clone(), value.clone());
                }
            }
        }
        record
    }
}

/// Keep only `fields` of a record.
pub fn project(record: &Record, fields: &[String]) -> Record {
    fields
        .iter()
        .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn genre() -> ModelSchema {
        ModelSchema::new("genre")
            .field(FieldDef::new("id", FieldKind::String).required())
            .field(FieldDef::new("name", FieldKind::String).required())
            .relation(RelationDef::new("categories", "category", ["id", "name"]))
    }

    #[test]
    fn test_pick_keeps_declared_fields() {
        let record = genre().pick(&json!({
            "id": "g1",
            "name": "Drama",
            "categories": [],
            "deleted_at": null,
            "extra": 1
        }));
        assert_eq!(record.len(), 3);
        assert!(record.contains_key("categories"));
        assert!(!record.contains_key("extra"));
    }

    #[test]
    fn test_pick_non_object_is_empty() {
        assert!(genre().pick(&Value::Null).is_empty());
        assert!(genre().pick(&json!(["id"])).is_empty());
    }

    #[test]
    fn test_relation_declares_array_field() {
        let schema = genre();
        assert_eq!(schema.field_def("categories").map(|f| f.kind), Some(FieldKind::Array));
        assert_eq!(schema.relation_def("categories").unwrap().model, "category");
        assert_eq!(schema.relations_to("category").count(), 1);
        assert_eq!(schema.relations_to("cast_member").count(), 0);
    }

    #[test]
    fn test_kind_accepts() {
        assert!(FieldKind::Integer.accepts(&json!(2)));
        assert!(!FieldKind::Integer.accepts(&json!(2.5)));
        assert!(FieldKind::Number.accepts(&json!(2.5)));
        assert!(FieldKind::DateTime.accepts(&json!("2024-01-01T00:00:00Z")));
        assert!(!FieldKind::Boolean.accepts(&json!("true")));
    }

    #[test]
    fn test_project() {
        let record = genre().pick(&json!({"id": "c1", "name": "Action"}));
        let projected = project(&record, &["id".to_string(), "missing".to_string()]);
        assert_eq!(Value::Object(projected), json!({"id": "c1"}));
    }
}
