//! Document driver interface
//!
//! The narrow seam between docflow and a document database driver. The
//! connection manager, the comparator and the migration engine only ever talk
//! to these traits. [`mongo`] talks to a MongoDB deployment, [`memory`] keeps
//! everything in process for tests and local runs.

pub mod document;
pub mod memory;
pub mod mongo;
pub mod schema;
pub mod session;

pub use document::{document_id, to_document, Document, ID_FIELD};
pub use memory::MemoryDriver;
pub use mongo::MongoDriver;
pub use schema::{CollectionSchema, FieldKind, IndexModel};
pub use session::{ClientSession, Transaction};

use crate::error::{MigrateError, MigrateResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Options passed through untouched from configuration to the driver
pub type DriverOptions = serde_json::Map<String, Value>;

/// Shared handle to a collection
pub type CollectionHandle = Arc<dyn Collection>;

/// Outcome of an update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Handles share their client's flag and stop working once it is closed
pub(crate) fn ensure_connected(connected: &AtomicBool) -> MigrateResult<()> {
    if connected.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(MigrateError::NotConnected("client is closed".to_string()))
    }
}

/// Entry point of a driver: turns an address into a connected client
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short driver name, used in logs
    fn name(&self) -> &str;

    async fn connect(&self, address: &str, options: &DriverOptions) -> MigrateResult<Arc<dyn Client>>;
}

/// A connected client
#[async_trait]
pub trait Client: Send + Sync {
    fn database(&self, name: &str) -> Arc<dyn Database>;

    async fn start_session(&self) -> MigrateResult<Box<dyn ClientSession>>;

    async fn close(&self) -> MigrateResult<()>;

    fn is_connected(&self) -> bool;
}

/// A logical database
#[async_trait]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    fn collection(&self, name: &str) -> CollectionHandle;

    async fn list_collection_names(&self) -> MigrateResult<Vec<String>>;

    /// Install (or replace) the validation schema of a collection
    async fn set_validator(&self, collection: &str, schema: CollectionSchema) -> MigrateResult<()>;
}

/// A collection of documents.
///
/// Every read and write accepts an optional session; when that session has an
/// open transaction the operation runs inside it.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    async fn find(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Vec<Document>>;

    async fn find_one(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Option<Document>>;

    /// Insert a document, returning its `_id`
    async fn insert_one(
        &self,
        document: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Value>;

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Vec<Value>>;

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<UpdateResult>;

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<UpdateResult>;

    /// Delete the first matching document, returning the deleted count
    async fn delete_one(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64>;

    async fn delete_many(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64>;

    async fn count_documents(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64>;

    /// Create an index, returning its name. Re-creating an identical index is a no-op.
    async fn create_index(&self, index: IndexModel) -> MigrateResult<String>;

    /// Remove the collection with its documents, indexes and validator
    async fn drop_collection(&self) -> MigrateResult<()>;
}
