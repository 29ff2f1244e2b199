//! Documents, filters and update operators
//!
//! Documents are JSON objects keyed by `_id`. Filters and updates use the
//! familiar document-database operator syntax (`$set`, `$in`, ...), restricted
//! to the subset migrations actually need.

use crate::error::{invalid_query, MigrateResult};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use uuid::Uuid;

/// A stored document
pub type Document = Map<String, Value>;

/// Name of the identity field
pub const ID_FIELD: &str = "_id";

/// Build a document from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty document.
pub fn to_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Identity of a document, if it has one
pub fn document_id(doc: &Document) -> Option<&Value> {
    doc.get(ID_FIELD)
}

/// Assign a fresh `_id` when the document does not carry one
pub fn ensure_id(doc: &mut Document) -> Value {
    if let Some(id) = document_id(doc) {
        return id.clone();
    }
    let id = Value::String(Uuid::new_v4().to_string());
    doc.insert(ID_FIELD.to_string(), id.clone());
    id
}

/// Resolve a dotted path (`profile.name`) inside a document
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> MigrateResult<()> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments
        .pop()
        .ok_or_else(|| invalid_query("empty field path"))?;

    let mut current = doc;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| invalid_query(format!("cannot set {} through non-object field {}", path, segment)))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return,
        }
    }
    current.remove(last);
}

/// Check whether `doc` satisfies `filter`.
///
/// An empty filter matches every document.
pub fn matches(doc: &Document, filter: &Document) -> MigrateResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let clauses = logical_clauses(key, condition)?;
                let mut all = true;
                for clause in clauses {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let clauses = logical_clauses(key, condition)?;
                let mut any = false;
                for clause in clauses {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            op if op.starts_with('$') => {
                return Err(invalid_query(format!("unsupported top-level operator {}", op)));
            }
            path => field_matches(get_path(doc, path), condition)?,
        };

        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_clauses<'a>(op: &str, condition: &'a Value) -> MigrateResult<Vec<&'a Document>> {
    condition
        .as_array()
        .ok_or_else(|| invalid_query(format!("{} expects an array", op)))?
        .iter()
        .map(|clause| {
            clause
                .as_object()
                .ok_or_else(|| invalid_query(format!("{} clauses must be objects", op)))
        })
        .collect()
}

fn is_operator_object(condition: &Value) -> bool {
    match condition.as_object() {
        Some(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        None => false,
    }
}

fn field_matches(value: Option<&Value>, condition: &Value) -> MigrateResult<bool> {
    if !is_operator_object(condition) {
        return Ok(value == Some(condition));
    }

    // Checked by is_operator_object
    let operators = condition.as_object().into_iter().flatten();
    for (op, arg) in operators {
        let ok = match op.as_str() {
            "$eq" => value == Some(arg),
            "$ne" => value != Some(arg),
            "$in" => {
                let candidates = arg
                    .as_array()
                    .ok_or_else(|| invalid_query("$in expects an array"))?;
                value.map(|v| candidates.contains(v)).unwrap_or(false)
            }
            "$exists" => {
                let wanted = arg
                    .as_bool()
                    .ok_or_else(|| invalid_query("$exists expects a boolean"))?;
                value.is_some() == wanted
            }
            "$gt" => compare(value, arg) == Some(Ordering::Greater),
            "$gte" => matches!(compare(value, arg), Some(Ordering::Greater | Ordering::Equal)),
            "$lt" => compare(value, arg) == Some(Ordering::Less),
            "$lte" => matches!(compare(value, arg), Some(Ordering::Less | Ordering::Equal)),
            other => return Err(invalid_query(format!("unsupported operator {}", other))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Order two values of the same kind; mixed kinds are incomparable
pub fn compare(value: Option<&Value>, other: &Value) -> Option<Ordering> {
    match (value?, other) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Some(a.cmp(&b));
            }
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Apply an update document (`{"$set": {...}}`) in place
pub fn apply_update(doc: &mut Document, update: &Document) -> MigrateResult<()> {
    if update.is_empty() {
        return Err(invalid_query("update document must not be empty"));
    }

    for (op, fields) in update {
        let fields = fields
            .as_object()
            .ok_or_else(|| invalid_query(format!("{} expects an object", op)))?;

        if fields.contains_key(ID_FIELD) {
            return Err(invalid_query("the _id field is immutable"));
        }

        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone())?;
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(doc, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let next = increment(get_path(doc, path), delta, path)?;
                    set_path(doc, path, next)?;
                }
            }
            other => return Err(invalid_query(format!("unsupported update operator {}", other))),
        }
    }
    Ok(())
}

fn increment(current: Option<&Value>, delta: &Value, path: &str) -> MigrateResult<Value> {
    let delta = match delta {
        Value::Number(n) => n,
        _ => return Err(invalid_query(format!("$inc on {} expects a number", path))),
    };

    let current = match current {
        None => return Ok(Value::Number(delta.clone())),
        Some(Value::Number(n)) => n,
        Some(_) => return Err(invalid_query(format!("cannot $inc non-numeric field {}", path))),
    };

    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::from(sum));
        }
    }

    let sum = current.as_f64().unwrap_or_default() + delta.as_f64().unwrap_or_default();
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| invalid_query(format!("$inc on {} produced a non-finite number", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn user() -> Document {
        to_document(json!({
            "_id": "u1",
            "username": "the-second",
            "age": 31,
            "profile": { "city": "Hanoi" }
        }))
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(matches(&user(), &Document::new()).unwrap());
    }

    #[test]
    fn test_equality_and_nested_paths() {
        let doc = user();
        assert!(matches(&doc, &to_document(json!({ "username": "the-second" }))).unwrap());
        assert!(matches(&doc, &to_document(json!({ "profile.city": "Hanoi" }))).unwrap());
        assert!(!matches(&doc, &to_document(json!({ "username": "the-one" }))).unwrap());
        assert!(!matches(&doc, &to_document(json!({ "missing": 1 }))).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let doc = user();
        assert!(matches(&doc, &to_document(json!({ "age": { "$gte": 31, "$lt": 40 } }))).unwrap());
        assert!(!matches(&doc, &to_document(json!({ "age": { "$gt": 31 } }))).unwrap());
        assert!(matches(&doc, &to_document(json!({ "age": { "$in": [1, 31] } }))).unwrap());
        assert!(matches(&doc, &to_document(json!({ "email": { "$exists": false } }))).unwrap());
        assert!(matches(&doc, &to_document(json!({ "username": { "$ne": "x" } }))).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let doc = user();
        let filter = to_document(json!({
            "$or": [{ "username": "nobody" }, { "age": 31 }]
        }));
        assert!(matches(&doc, &filter).unwrap());

        let filter = to_document(json!({
            "$and": [{ "username": "the-second" }, { "age": 1 }]
        }));
        assert!(!matches(&doc, &filter).unwrap());
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let result = matches(&user(), &to_document(json!({ "age": { "$regex": "3" } })));
        assert!(result.is_err());
    }

    #[test]
    fn test_set_unset_inc() {
        let mut doc = user();
        let update = to_document(json!({
            "$set": { "username": "the-final", "profile.zip": "100000" },
            "$unset": { "profile.city": "" },
            "$inc": { "age": 1, "logins": 2 }
        }));
        apply_update(&mut doc, &update).unwrap();

        assert_eq!(
            Value::Object(doc),
            json!({
                "_id": "u1",
                "username": "the-final",
                "age": 32,
                "logins": 2,
                "profile": { "zip": "100000" }
            })
        );
    }

    #[test]
    fn test_id_is_immutable() {
        let mut doc = user();
        let update = to_document(json!({ "$set": { "_id": "other" } }));
        assert!(apply_update(&mut doc, &update).is_err());
    }

    #[test]
    fn test_ensure_id_keeps_existing() {
        let mut doc = user();
        assert_eq!(ensure_id(&mut doc), json!("u1"));

        let mut fresh = to_document(json!({ "username": "new" }));
        let id = ensure_id(&mut fresh);
        assert!(id.is_string());
        assert_eq!(document_id(&fresh), Some(&id));
    }
}
