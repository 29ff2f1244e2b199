//! Document Diff Engine
//!
//! Compares two captures of the same collection by `_id`, never by position.

use crate::driver::{document_id, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Type of document change detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// A single changed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChange {
    pub change_type: ChangeType,
    /// `_id` of the document, rendered as JSON
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Document>,
}

/// All changes in one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDiff {
    pub collection: String,
    pub changes: Vec<DocumentChange>,
    /// Documents without an `_id` cannot be paired and are counted here
    pub unkeyed: usize,
}

impl DocumentDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.unkeyed == 0
    }

    pub fn count(&self, change_type: ChangeType) -> usize {
        self.changes
            .iter()
            .filter(|c| c.change_type == change_type)
            .count()
    }
}

fn key_of(doc: &Document) -> Option<String> {
    document_id(doc).map(Value::to_string)
}

fn keyed(docs: &[Document]) -> (HashMap<String, &Document>, usize) {
    let mut map = HashMap::new();
    let mut unkeyed = 0;
    for doc in docs {
        match key_of(doc) {
            Some(key) => {
                map.insert(key, doc);
            }
            None => unkeyed += 1,
        }
    }
    (map, unkeyed)
}

/// Check two captures for equality: same size, and every document of `a` has
/// a deeply equal document with the same `_id` in `b`. Order is irrelevant.
pub fn are_same_documents(a: &[Document], b: &[Document]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let (by_id, _) = keyed(b);
    a.iter().all(|doc| {
        key_of(doc)
            .and_then(|key| by_id.get(&key))
            .map(|other| *other == doc)
            .unwrap_or(false)
    })
}

/// The diff engine that compares collection captures
pub struct DiffEngine;

impl DiffEngine {
    /// Every added, removed and modified document between two captures
    pub fn diff(collection: &str, before: &[Document], after: &[Document]) -> DocumentDiff {
        let (from_map, from_unkeyed) = keyed(before);
        let (to_map, to_unkeyed) = keyed(after);

        let from_keys: HashSet<&String> = from_map.keys().collect();
        let to_keys: HashSet<&String> = to_map.keys().collect();

        let mut changes = Vec::new();

        for key in to_keys.difference(&from_keys) {
            changes.push(DocumentChange {
                change_type: ChangeType::Added,
                id: key.to_string(),
                before: None,
                after: to_map.get(*key).map(|d| (*d).clone()),
            });
        }

        for key in from_keys.difference(&to_keys) {
            changes.push(DocumentChange {
                change_type: ChangeType::Removed,
                id: key.to_string(),
                before: from_map.get(*key).map(|d| (*d).clone()),
                after: None,
            });
        }

        for key in from_keys.intersection(&to_keys) {
            let (Some(from), Some(to)) = (from_map.get(*key), to_map.get(*key)) else {
                continue;
            };
            if from != to {
                changes.push(DocumentChange {
                    change_type: ChangeType::Modified,
                    id: key.to_string(),
                    before: Some((*from).clone()),
                    after: Some((*to).clone()),
                });
            }
        }

        // HashSet iteration order is arbitrary
        changes.sort_by(|a, b| a.id.cmp(&b.id));

        DocumentDiff {
            collection: collection.to_string(),
            changes,
            unkeyed: from_unkeyed + to_unkeyed,
        }
    }
}
