//! Index and schema-constraint models
//!
//! These are the driver-neutral descriptions the migration engine hands to
//! `Collection::create_index` and `Database::set_validator`.

use crate::driver::document::{get_path, Document};
use crate::error::{MigrateError, MigrateResult};
use chrono::DateTime;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Compiled property patterns, keyed by source
static PATTERNS: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn compiled(pattern: &str) -> MigrateResult<Regex> {
    let mut patterns = PATTERNS.lock();
    if let Some(re) = patterns.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)
        .map_err(|e| MigrateError::Config(format!("invalid pattern {}: {}", pattern, e)))?;
    patterns.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Index definition on one or more fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexModel {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
}

impl IndexModel {
    /// Unique single-field index named `<field>_1`
    pub fn unique(field: &str) -> Self {
        Self {
            name: format!("{}_1", field),
            keys: vec![field.to_string()],
            unique: true,
        }
    }

    /// Key tuple for a document. A missing field keys as `null`, so a unique
    /// index admits at most one document lacking it.
    pub fn key_of(&self, doc: &Document) -> Vec<Value> {
        self.keys
            .iter()
            .map(|field| get_path(doc, field).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Expected type of a document field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    Number,
    String,
    Bool,
    Timestamp,
    Object,
    Array,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Int => value.as_i64().is_some() || value.as_u64().is_some(),
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Timestamp => value
                .as_str()
                .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    /// `bsonType` used in a `$jsonSchema` validator
    fn bson_type(self) -> Value {
        match self {
            FieldKind::Int => json!(["int", "long"]),
            FieldKind::Number => json!("number"),
            FieldKind::String | FieldKind::Timestamp => json!("string"),
            FieldKind::Bool => json!("bool"),
            FieldKind::Object => json!("object"),
            FieldKind::Array => json!("array"),
        }
    }
}

/// Rule applied to one property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRule {
    pub kind: FieldKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Validation schema installed on a collection.
///
/// Applies to every insert and update after installation; existing documents
/// are not re-checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub required: Vec<String>,
    pub properties: BTreeMap<String, PropertyRule>,
}

impl CollectionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required property
    pub fn require(mut self, field: &str, kind: FieldKind) -> Self {
        self.required.push(field.to_string());
        self.properties.insert(
            field.to_string(),
            PropertyRule {
                kind,
                pattern: None,
            },
        );
        self
    }

    /// Add a required string property constrained by a regex
    pub fn require_pattern(mut self, field: &str, pattern: &str) -> Self {
        self.required.push(field.to_string());
        self.properties.insert(
            field.to_string(),
            PropertyRule {
                kind: FieldKind::String,
                pattern: Some(pattern.to_string()),
            },
        );
        self
    }

    /// Check a document against the schema
    pub fn validate(&self, collection: &str, doc: &Document) -> MigrateResult<()> {
        let violation = |reason: String| MigrateError::SchemaViolation {
            collection: collection.to_string(),
            reason,
        };

        for field in &self.required {
            if get_path(doc, field).is_none() {
                return Err(violation(format!("missing required field {}", field)));
            }
        }

        for (field, rule) in &self.properties {
            let Some(value) = get_path(doc, field) else {
                continue;
            };

            if !rule.kind.accepts(value) {
                return Err(violation(format!("field {} is not of type {:?}", field, rule.kind)));
            }

            if let (Some(pattern), Some(text)) = (&rule.pattern, value.as_str()) {
                if !compiled(pattern)?.is_match(text) {
                    return Err(violation(format!("field {} does not match {}", field, pattern)));
                }
            }
        }
        Ok(())
    }

    /// The schema as a MongoDB `$jsonSchema` document.
    ///
    /// Timestamps are checked as strings only; the RFC 3339 shape is enforced
    /// client-side by [`CollectionSchema::validate`].
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .properties
            .iter()
            .map(|(field, rule)| {
                let mut property = json!({ "bsonType": rule.kind.bson_type() });
                if let Some(pattern) = &rule.pattern {
                    property["pattern"] = json!(pattern);
                }
                (field.clone(), property)
            })
            .collect();

        json!({
            "bsonType": "object",
            "required": self.required,
            "properties": properties,
        })
    }
}
