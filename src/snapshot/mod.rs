//! Collection Snapshot Module
//!
//! Detecting what an action changed in the database:
//! - Collection captures (point-in-time document dumps)
//! - Document diff engine (comparing captures by identity)
//! - Before/after comparison around an arbitrary action

pub mod diff;

pub use diff::{are_same_documents, ChangeType, DiffEngine, DocumentChange, DocumentDiff};

use crate::driver::{CollectionHandle, Document};
use crate::error::MigrateResult;
use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::debug;

/// Documents of one collection at a point in time
pub struct CollectionSnapshot {
    pub collection: CollectionHandle,
    pub documents: Vec<Document>,
    pub captured_at: DateTime<Utc>,
}

/// Capture every collection, in order
pub async fn capture(collections: &[CollectionHandle]) -> MigrateResult<Vec<CollectionSnapshot>> {
    let mut snapshots = Vec::with_capacity(collections.len());
    for collection in collections {
        let documents = collection.find(Document::new(), None).await?;
        debug!("Captured {} documents from {}", documents.len(), collection.name());
        snapshots.push(CollectionSnapshot {
            collection: collection.clone(),
            documents,
            captured_at: Utc::now(),
        });
    }
    Ok(snapshots)
}

/// Collections partitioned by whether an action changed them
pub struct Comparison {
    /// Unchanged collections, in input order
    pub same: Vec<CollectionHandle>,
    /// Changed collections, in input order
    pub differ: Vec<CollectionHandle>,
    /// One diff per entry of `differ`
    pub diffs: Vec<DocumentDiff>,
}

impl Comparison {
    /// Names of the unchanged collections
    pub fn same_names(&self) -> Vec<&str> {
        self.same.iter().map(|c| c.name()).collect()
    }

    /// Names of the changed collections
    pub fn differ_names(&self) -> Vec<&str> {
        self.differ.iter().map(|c| c.name()).collect()
    }
}

/// Snapshot `collections`, run `action`, snapshot again and classify each
/// collection as same or differ. An action error is returned as-is.
pub async fn compare_after_action<F>(collections: &[CollectionHandle], action: F) -> MigrateResult<Comparison>
where
    F: Future<Output = MigrateResult<()>>,
{
    let before = capture(collections).await?;
    action.await?;
    let after = capture(collections).await?;

    let mut comparison = Comparison {
        same: Vec::new(),
        differ: Vec::new(),
        diffs: Vec::new(),
    };

    for (before, after) in before.into_iter().zip(after) {
        if are_same_documents(&before.documents, &after.documents) {
            comparison.same.push(before.collection);
        } else {
            comparison.diffs.push(DiffEngine::diff(
                before.collection.name(),
                &before.documents,
                &after.documents,
            ));
            comparison.differ.push(before.collection);
        }
    }

    debug!(
        "Comparison finished: {} same, {} differ",
        comparison.same.len(),
        comparison.differ.len()
    );
    Ok(comparison)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ManagerConfig};
    use crate::driver::{to_document, MemoryDriver};
    use crate::error::MigrateError;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    async fn manager() -> ConnectionManager {
        let config = ManagerConfig::new("memory://comparator", "app")
            .with_collection("UserCollection", "user")
            .with_collection("PostCollection", "post");
        let mut manager = ConnectionManager::new(config, Arc::new(MemoryDriver::new()));
        manager.connect().await.unwrap();
        manager
    }

    fn handles(manager: &ConnectionManager) -> (CollectionHandle, CollectionHandle) {
        (
            manager.collection("UserCollection").unwrap(),
            manager.collection("PostCollection").unwrap(),
        )
    }

    async fn seed(users: &CollectionHandle, posts: &CollectionHandle) {
        users
            .insert_many(
                vec![
                    to_document(json!({ "username": "trubavuong" })),
                    to_document(json!({ "username": "vuongtru" })),
                ],
                None,
            )
            .await
            .unwrap();
        posts
            .insert_many(
                vec![
                    to_document(json!({ "username": "trubavuong", "content": "Hello World" })),
                    to_document(json!({ "username": "trubavuong", "content": "Bye" })),
                    to_document(json!({ "username": "vuongtru", "content": "Hi Kitty" })),
                ],
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_noop_action_on_empty_collections() {
        let manager = manager().await;
        let (users, posts) = handles(&manager);

        let result = compare_after_action(&[users, posts], async { Ok::<(), MigrateError>(()) })
            .await
            .unwrap();
        assert_eq!(result.same_names(), vec!["user", "post"]);
        assert!(result.differ.is_empty());
    }

    #[tokio::test]
    async fn test_noop_action_on_populated_collections() {
        let manager = manager().await;
        let (users, posts) = handles(&manager);
        seed(&users, &posts).await;

        let result = compare_after_action(&[users, posts], async { Ok::<(), MigrateError>(()) })
            .await
            .unwrap();
        assert_eq!(result.same_names(), vec!["user", "post"]);
        assert!(result.diffs.is_empty());
    }

    #[tokio::test]
    async fn test_action_changing_one_collection() {
        let manager = manager().await;
        let (users, posts) = handles(&manager);

        let action = {
            let users = users.clone();
            async move {
                users
                    .insert_one(to_document(json!({ "username": "trubavuong" })), None)
                    .await
                    .map(|_| ())
            }
        };
        let result = compare_after_action(&[users, posts], action).await.unwrap();

        assert_eq!(result.same_names(), vec!["post"]);
        assert_eq!(result.differ_names(), vec!["user"]);
        assert_eq!(result.diffs[0].count(ChangeType::Added), 1);
    }

    #[tokio::test]
    async fn test_action_changing_every_collection() {
        let manager = manager().await;
        let (users, posts) = handles(&manager);
        seed(&users, &posts).await;

        let action = {
            let (users, posts) = (users.clone(), posts.clone());
            async move {
                users
                    .update_one(
                        to_document(json!({ "username": "trubavuong" })),
                        to_document(json!({ "$set": { "name": "Vuong Tru" } })),
                        None,
                    )
                    .await?;
                posts
                    .update_one(
                        to_document(json!({ "content": "Bye" })),
                        to_document(json!({ "$set": { "content": "See you soon" } })),
                        None,
                    )
                    .await?;
                Ok::<(), MigrateError>(())
            }
        };
        let result = compare_after_action(&[users, posts], action).await.unwrap();

        assert!(result.same.is_empty());
        assert_eq!(result.differ_names(), vec!["user", "post"]);
        assert!(result
            .diffs
            .iter()
            .all(|d| d.count(ChangeType::Modified) == 1));
    }

    #[tokio::test]
    async fn test_action_error_propagates() {
        let manager = manager().await;
        let (users, _) = handles(&manager);

        let result = compare_after_action(&[users], async {
            Err::<(), _>(MigrateError::InvalidQuery("boom".to_string()))
        })
        .await;
        assert!(matches!(result, Err(MigrateError::InvalidQuery(_))));
    }
}
