//! Payload validation against model schemas.
//!
//! [`SchemaValidator`] compiles each schema once (regex patterns included) and
//! caches it by model name. The cache only grows.

use crate::schema::{FieldDef, FieldKind, ModelSchema};
use crate::store::Record;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// One offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{model} failed validation: {}", summary(.violations))]
pub struct ValidationError {
    pub model: String,
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.violations.iter().map(|v| v.field.as_str())
    }
}

fn summary(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    /// Skip required-field checks (partial updates)
    pub partial: bool,
}

impl ValidateOptions {
    pub fn full() -> Self {
        Self { partial: false }
    }

    pub fn partial() -> Self {
        Self { partial: true }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        data: &Record,
        schema: &ModelSchema,
        options: ValidateOptions,
    ) -> Result<(), ValidationError>;
}

struct CompiledField {
    def: FieldDef,
    pattern: Option<Result<Regex, String>>,
    relation: bool,
}

struct CompiledSchema {
    fields: Vec<CompiledField>,
}

impl CompiledSchema {
    fn compile(schema: &ModelSchema) -> Self {
        let fields = schema
            .fields
            .iter()
            .map(|def| CompiledField {
                pattern: def
                    .pattern
                    .as_deref()
                    .map(|p| Regex::new(p).map_err(|e| e.to_string())),
                relation: schema.relation_def(&def.name).is_some(),
                def: def.clone(),
            })
            .collect();
        Self { fields }
    }

    fn check(&self, data: &Record, options: ValidateOptions) -> Vec<FieldViolation> {
        let mut violations = Vec::new();
        for field in &self.fields {
            let name = &field.def.name;
            let violation = |message: String| FieldViolation {
                field: name.clone(),
                message,
            };

            let value = match data.get(name) {
                None if field.def.required && !options.partial => {
                    violations.push(violation("is required".to_string()));
                    continue;
                }
                None => continue,
                Some(Value::Null) if field.def.required => {
                    violations.push(violation("must not be null".to_string()));
                    continue;
                }
                Some(Value::Null) => continue,
                Some(value) => value,
            };

            if let Some(message) = field.check_value(value) {
                violations.push(violation(message));
            }
        }
        violations
    }
}

impl CompiledField {
    fn check_value(&self, value: &Value) -> Option<String> {
        let def = &self.def;
        if !def.kind.accepts(value) {
            return Some(format!("must be {}", article(def.kind)));
        }

        if !def.allowed.is_empty() && !def.allowed.contains(value) {
            let allowed: Vec<String> = def.allowed.iter().map(ToString::to_string).collect();
            return Some(format!("must be one of [{}]", allowed.join(", ")));
        }

        if let Value::String(s) = value {
            if let Some(max) = def.max_length {
                if s.chars().count() > max {
                    return Some(format!("must be at most {} characters", max));
                }
            }
            if def.kind == FieldKind::DateTime && chrono::DateTime::parse_from_rfc3339(s).is_err() {
                return Some("must be an RFC 3339 date-time".to_string());
            }
            match &self.pattern {
                Some(Ok(regex)) if !regex.is_match(s) => {
                    return Some(format!("must match {}", regex.as_str()));
                }
                Some(Err(e)) => return Some(format!("has an invalid pattern: {}", e)),
                _ => {}
            }
        }

        if self.relation {
            if let Value::Array(items) = value {
                let all_identified = items.iter().all(|item| {
                    item.get("id")
                        .map(|id| id.is_string() || id.is_number())
                        .unwrap_or(false)
                });
                if !all_identified {
                    return Some("items must be objects with an id".to_string());
                }
            }
        }

        None
    }
}

fn article(kind: FieldKind) -> String {
    match kind {
        FieldKind::Integer | FieldKind::Array | FieldKind::Object => {
            format!("an {}", kind.as_str())
        }
        _ => format!("a {}", kind.as_str()),
    }
}

/// Validator with a compiled-schema cache keyed by model name.
#[derive(Default)]
pub struct SchemaValidator {
    cache: RwLock<HashMap<String, Arc<CompiledSchema>>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cached_models(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn compiled(&self, schema: &ModelSchema) -> Arc<CompiledSchema> {
        if let Some(compiled) = self.cache.read().await.get(&schema.name) {
            return compiled.clone();
        }

        let mut cache = self.cache.write().await;
        cache
            .entry(schema.name.clone())
            .or_insert_with(|| {
                debug!(model = %schema.name, "Compiling schema");
                Arc::new(CompiledSchema::compile(schema))
            })
            .clone()
    }
}

#[async_trait]
impl Validator for SchemaValidator {
    async fn validate(
        &self,
        data: &Record,
        schema: &ModelSchema,
        options: ValidateOptions,
    ) -> Result<(), ValidationError> {
        let violations = self.compiled(schema).await.check(data, options);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                model: schema.name.clone(),
                violations,
            })
        }
    }
}
