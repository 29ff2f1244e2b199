//! MongoDB driver
//!
//! Serves `mongodb://` and `mongodb+srv://` addresses through the official
//! `mongodb` crate. Transactions need a replica set or a sharded cluster.
//!
//! Documents cross the boundary as relaxed extended JSON: an `ObjectId` reads
//! back as `{"$oid": "..."}` and is accepted in that shape in filters.

use crate::driver::document::{ensure_id, Document};
use crate::driver::schema::{CollectionSchema, IndexModel};
use crate::driver::{
    ensure_connected, Client, ClientSession, Collection, CollectionHandle, Database, Driver,
    DriverOptions, UpdateResult,
};
use crate::error::{invalid_query, transaction_error, MigrateError, MigrateResult};
use async_trait::async_trait;
use bson::{doc, Bson};
use mongodb::error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR};
use mongodb::options::{ClientOptions, IndexOptions};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DUPLICATE_KEY: i32 = 11000;
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;
const NAMESPACE_NOT_FOUND: i32 = 26;

static DUPLICATE_KEY_DETAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"index: (\S+) dup key: (.*)$").unwrap());

fn to_bson(value: Value) -> MigrateResult<Bson> {
    Bson::try_from(value).map_err(|e| invalid_query(e.to_string()))
}

fn to_bson_document(doc: Document) -> MigrateResult<bson::Document> {
    match to_bson(Value::Object(doc))? {
        Bson::Document(doc) => Ok(doc),
        other => Err(invalid_query(format!("expected a document, got {}", other))),
    }
}

fn from_bson_document(doc: bson::Document) -> Document {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Server error code and message, when the failure came from the server
fn server_error(err: &mongodb::error::Error) -> Option<(i32, &str)> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => Some((e.code, e.message.as_str())),
        ErrorKind::Command(e) => Some((e.code, e.message.as_str())),
        _ => None,
    }
}

fn duplicate_key(message: &str) -> MigrateError {
    match DUPLICATE_KEY_DETAIL.captures(message) {
        Some(caps) => MigrateError::DuplicateKey {
            index: caps[1].to_string(),
            value: caps[2].to_string(),
        },
        None => MigrateError::DuplicateKey {
            index: "unknown".to_string(),
            value: message.to_string(),
        },
    }
}

/// Translate a driver error raised while working on `collection`
fn map_error(collection: &str, err: mongodb::error::Error) -> MigrateError {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        return MigrateError::TransactionConflict(err.to_string());
    }
    match server_error(&err) {
        Some((DUPLICATE_KEY, message)) => duplicate_key(message),
        Some((DOCUMENT_VALIDATION_FAILURE, message)) => MigrateError::SchemaViolation {
            collection: collection.to_string(),
            reason: message.to_string(),
        },
        _ => MigrateError::Database(err),
    }
}

fn transaction_failure(err: mongodb::error::Error) -> MigrateError {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        MigrateError::TransactionConflict(err.to_string())
    } else {
        transaction_error(err.to_string())
    }
}

fn connection_error(err: mongodb::error::Error) -> MigrateError {
    MigrateError::Connection(err.to_string())
}

/// Apply the supported pass-through options, logging the rest
fn apply_options(client_options: &mut ClientOptions, options: &DriverOptions) {
    let millis = |value: &Value| value.as_u64().map(Duration::from_millis);

    for (key, value) in options {
        match key.as_str() {
            "appName" => client_options.app_name = value.as_str().map(String::from),
            "serverSelectionTimeoutMs" => client_options.server_selection_timeout = millis(value),
            "connectTimeoutMs" => client_options.connect_timeout = millis(value),
            "maxPoolSize" => {
                client_options.max_pool_size = value.as_u64().and_then(|n| u32::try_from(n).ok())
            }
            _ => debug!("Ignoring driver option {}", key),
        }
    }
}

type SharedSession = Arc<tokio::sync::Mutex<mongodb::ClientSession>>;

/// Driver sessions of one client, keyed by the id handed out to callers
#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<Uuid, SharedSession>>,
}

impl SessionTable {
    fn resolve(&self, session: Option<&dyn ClientSession>) -> MigrateResult<Option<SharedSession>> {
        let Some(session) = session else {
            return Ok(None);
        };
        self.sessions
            .lock()
            .get(&session.id())
            .cloned()
            .map(Some)
            .ok_or_else(|| transaction_error("session was not started by this client"))
    }
}

/// Run a driver action, inside the session when there is one
macro_rules! run {
    ($action:expr, $session:expr) => {
        match $session {
            Some(shared) => {
                let mut guard = shared.lock().await;
                $action.session(&mut *guard).await
            }
            None => $action.await,
        }
    };
}

/// Driver serving `mongodb://` and `mongodb+srv://` addresses
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoDriver;

impl MongoDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn connect(&self, address: &str, options: &DriverOptions) -> MigrateResult<Arc<dyn Client>> {
        let mut client_options = ClientOptions::parse(address).await.map_err(connection_error)?;
        apply_options(&mut client_options, options);

        let inner = mongodb::Client::with_options(client_options).map_err(connection_error)?;
        inner
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(connection_error)?;

        info!("Connected to MongoDB");
        Ok(Arc::new(MongoClient {
            inner,
            sessions: Arc::default(),
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MongoClient {
    inner: mongodb::Client,
    sessions: Arc<SessionTable>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Client for MongoClient {
    fn database(&self, name: &str) -> Arc<dyn Database> {
        Arc::new(MongoDatabase {
            inner: self.inner.database(name),
            sessions: self.sessions.clone(),
            connected: self.connected.clone(),
        })
    }

    async fn start_session(&self) -> MigrateResult<Box<dyn ClientSession>> {
        ensure_connected(&self.connected)?;
        let session = self.inner.start_session().await?;

        let id = Uuid::new_v4();
        let session = Arc::new(tokio::sync::Mutex::new(session));
        self.sessions.sessions.lock().insert(id, session.clone());

        Ok(Box::new(MongoSession {
            id,
            session,
            sessions: self.sessions.clone(),
            in_transaction: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> MigrateResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.inner.clone().shutdown().immediate(true).await;
            debug!("MongoDB client shut down");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MongoDatabase {
    inner: mongodb::Database,
    sessions: Arc<SessionTable>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Database for MongoDatabase {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn collection(&self, name: &str) -> CollectionHandle {
        Arc::new(MongoCollection {
            inner: self.inner.collection(name),
            sessions: self.sessions.clone(),
            connected: self.connected.clone(),
        })
    }

    async fn list_collection_names(&self) -> MigrateResult<Vec<String>> {
        ensure_connected(&self.connected)?;
        Ok(self.inner.list_collection_names().await?)
    }

    /// `collMod` on an existing collection, `create` with the validator otherwise
    async fn set_validator(&self, collection: &str, schema: CollectionSchema) -> MigrateResult<()> {
        ensure_connected(&self.connected)?;
        let validator = doc! { "$jsonSchema": to_bson(schema.to_json_schema())? };

        let command = doc! {
            "collMod": collection,
            "validator": validator.clone(),
            "validationLevel": "strict",
        };
        match self.inner.run_command(command).await {
            Ok(_) => {}
            Err(e) if matches!(server_error(&e), Some((NAMESPACE_NOT_FOUND, _))) => {
                self.inner
                    .create_collection(collection)
                    .validator(validator)
                    .await
                    .map_err(|e| map_error(collection, e))?;
            }
            Err(e) => return Err(map_error(collection, e)),
        }

        debug!("Validator installed on {}", collection);
        Ok(())
    }
}

struct MongoCollection {
    inner: mongodb::Collection<bson::Document>,
    sessions: Arc<SessionTable>,
    connected: Arc<AtomicBool>,
}

impl MongoCollection {
    fn session(&self, session: Option<&dyn ClientSession>) -> MigrateResult<Option<SharedSession>> {
        ensure_connected(&self.connected)?;
        self.sessions.resolve(session)
    }

    fn error(&self, err: mongodb::error::Error) -> MigrateError {
        map_error(self.inner.name(), err)
    }
}

#[async_trait]
impl Collection for MongoCollection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn find(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Vec<Document>> {
        let session = self.session(session)?;
        let filter = to_bson_document(filter)?;
        let mut documents = Vec::new();

        match session {
            Some(shared) => {
                let mut guard = shared.lock().await;
                let mut cursor = self
                    .inner
                    .find(filter)
                    .session(&mut *guard)
                    .await
                    .map_err(|e| self.error(e))?;
                while cursor.advance(&mut *guard).await.map_err(|e| self.error(e))? {
                    let doc = cursor.deserialize_current().map_err(|e| self.error(e))?;
                    documents.push(from_bson_document(doc));
                }
            }
            None => {
                let mut cursor = self.inner.find(filter).await.map_err(|e| self.error(e))?;
                while cursor.advance().await.map_err(|e| self.error(e))? {
                    let doc = cursor.deserialize_current().map_err(|e| self.error(e))?;
                    documents.push(from_bson_document(doc));
                }
            }
        }
        Ok(documents)
    }

    async fn find_one(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Option<Document>> {
        let session = self.session(session)?;
        let filter = to_bson_document(filter)?;
        let found = run!(self.inner.find_one(filter), &session).map_err(|e| self.error(e))?;
        Ok(found.map(from_bson_document))
    }

    async fn insert_one(
        &self,
        mut document: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Value> {
        let session = self.session(session)?;
        let id = ensure_id(&mut document);
        let document = to_bson_document(document)?;
        run!(self.inner.insert_one(document), &session).map_err(|e| self.error(e))?;
        Ok(id)
    }

    async fn insert_many(
        &self,
        mut documents: Vec<Document>,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Vec<Value>> {
        let session = self.session(session)?;
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Value> = documents.iter_mut().map(ensure_id).collect();
        let documents = documents
            .into_iter()
            .map(to_bson_document)
            .collect::<MigrateResult<Vec<_>>>()?;
        run!(self.inner.insert_many(documents), &session).map_err(|e| self.error(e))?;
        Ok(ids)
    }

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<UpdateResult> {
        let session = self.session(session)?;
        let (filter, update) = (to_bson_document(filter)?, to_bson_document(update)?);
        let result = run!(self.inner.update_one(filter, update), &session).map_err(|e| self.error(e))?;
        Ok(UpdateResult {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
        })
    }

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<UpdateResult> {
        let session = self.session(session)?;
        let (filter, update) = (to_bson_document(filter)?, to_bson_document(update)?);
        let result = run!(self.inner.update_many(filter, update), &session).map_err(|e| self.error(e))?;
        Ok(UpdateResult {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
        })
    }

    async fn delete_one(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64> {
        let session = self.session(session)?;
        let filter = to_bson_document(filter)?;
        let result = run!(self.inner.delete_one(filter), &session).map_err(|e| self.error(e))?;
        Ok(result.deleted_count)
    }

    async fn delete_many(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64> {
        let session = self.session(session)?;
        let filter = to_bson_document(filter)?;
        let result = run!(self.inner.delete_many(filter), &session).map_err(|e| self.error(e))?;
        Ok(result.deleted_count)
    }

    async fn count_documents(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64> {
        let session = self.session(session)?;
        let filter = to_bson_document(filter)?;
        run!(self.inner.count_documents(filter), &session).map_err(|e| self.error(e))
    }

    async fn create_index(&self, index: IndexModel) -> MigrateResult<String> {
        ensure_connected(&self.connected)?;
        let model = index_model(&index);
        let created = self.inner.create_index(model).await.map_err(|e| self.error(e))?;
        debug!("Index {} ready on {}", created.index_name, self.inner.name());
        Ok(created.index_name)
    }

    async fn drop_collection(&self) -> MigrateResult<()> {
        ensure_connected(&self.connected)?;
        self.inner.drop().await.map_err(|e| self.error(e))
    }
}

fn index_model(index: &IndexModel) -> mongodb::IndexModel {
    let mut keys = bson::Document::new();
    for key in &index.keys {
        keys.insert(key.clone(), 1i32);
    }
    let options = IndexOptions::builder()
        .name(index.name.clone())
        .unique(index.unique)
        .build();
    mongodb::IndexModel::builder().keys(keys).options(options).build()
}

struct MongoSession {
    id: Uuid,
    session: SharedSession,
    sessions: Arc<SessionTable>,
    in_transaction: AtomicBool,
}

#[async_trait]
impl ClientSession for MongoSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    async fn start_transaction(&self) -> MigrateResult<()> {
        if self.in_transaction() {
            return Err(transaction_error("a transaction is already in progress on this session"));
        }
        self.session
            .lock()
            .await
            .start_transaction()
            .await
            .map_err(transaction_failure)?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_transaction(&self) -> MigrateResult<()> {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return Err(transaction_error("no transaction in progress on this session"));
        }
        self.session
            .lock()
            .await
            .commit_transaction()
            .await
            .map_err(transaction_failure)
    }

    async fn abort_transaction(&self) -> MigrateResult<()> {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return Err(transaction_error("no transaction in progress on this session"));
        }
        self.session
            .lock()
            .await
            .abort_transaction()
            .await
            .map_err(transaction_failure)
    }

    fn abandon(&self) {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return;
        }
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.lock().await.abort_transaction().await {
                        warn!("Failed to abort abandoned transaction: {}", e);
                    }
                });
            }
            Err(_) => warn!(session = %self.id, "No runtime to abort the abandoned transaction, the server will time it out"),
        }
    }
}

impl Drop for MongoSession {
    fn drop(&mut self) {
        self.abandon();
        self.sessions.sessions.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ManagerConfig};
    use crate::driver::{to_document, FieldKind, Transaction};
    use crate::migration::{MemoryReporter, Migrator, MigratorConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Live tests run only when a replica set address is provided
    fn live_address() -> Option<String> {
        std::env::var("DOCFLOW_TEST_MONGODB_URI").ok()
    }

    fn scratch_database() -> String {
        format!("docflow_test_{}", Uuid::new_v4().simple())
    }

    #[test]
    fn test_filters_keep_operators_and_extended_json() {
        let filter = to_document(json!({
            "age": { "$gte": 31 },
            "_id": { "$oid": "65f1c0ffee00000000000001" },
        }));
        let converted = to_bson_document(filter).unwrap();
        assert_eq!(converted.get_document("age").unwrap().get_i32("$gte").unwrap(), 31);
        assert!(matches!(converted.get("_id"), Some(Bson::ObjectId(_))));

        assert_eq!(
            from_bson_document(converted),
            to_document(json!({
                "age": { "$gte": 31 },
                "_id": { "$oid": "65f1c0ffee00000000000001" },
            }))
        );
    }

    #[test]
    fn test_duplicate_key_message() {
        let err = duplicate_key(
            r#"E11000 duplicate key error collection: app.migration index: filename_1 dup key: { filename: "1.a.json" }"#,
        );
        match err {
            MigrateError::DuplicateKey { index, value } => {
                assert_eq!(index, "filename_1");
                assert_eq!(value, r#"{ filename: "1.a.json" }"#);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(matches!(
            duplicate_key("E11000 duplicate key error"),
            MigrateError::DuplicateKey { ref index, .. } if index == "unknown"
        ));
    }

    #[test]
    fn test_driver_options_are_applied() {
        let mut client_options = ClientOptions::default();
        let options = to_document(json!({
            "appName": "docflow",
            "serverSelectionTimeoutMs": 1500,
            "maxPoolSize": 4,
            "unknownOption": true,
        }));
        apply_options(&mut client_options, &options);

        assert_eq!(client_options.app_name.as_deref(), Some("docflow"));
        assert_eq!(client_options.server_selection_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(client_options.max_pool_size, Some(4));
        assert_eq!(client_options.connect_timeout, None);
    }

    #[test]
    fn test_index_model_is_named_and_unique() {
        let model = index_model(&IndexModel::unique("filename"));
        assert_eq!(model.keys, doc! { "filename": 1 });
        let options = model.options.unwrap();
        assert_eq!(options.name.as_deref(), Some("filename_1"));
        assert_eq!(options.unique, Some(true));
    }

    #[tokio::test]
    async fn test_malformed_address_is_a_connection_error() {
        let result = MongoDriver::new().connect("mongodb://", &DriverOptions::new()).await;
        assert!(matches!(result, Err(MigrateError::Connection(_))));
    }

    #[tokio::test]
    async fn test_live_transaction_and_unique_index() {
        let Some(address) = live_address() else {
            return;
        };
        let client = MongoDriver::new()
            .connect(&address, &DriverOptions::new())
            .await
            .unwrap();
        let db = client.database(&scratch_database());
        let coll = db.collection("migration");
        coll.create_index(IndexModel::unique("filename")).await.unwrap();
        db.set_validator("migration", CollectionSchema::new().require("version", FieldKind::Int))
            .await
            .unwrap();

        let txn = Transaction::begin(client.start_session().await.unwrap())
            .await
            .unwrap();
        coll.insert_one(to_document(json!({ "version": 1, "filename": "1.a.json" })), Some(txn.session()))
            .await
            .unwrap();
        txn.abort().await.unwrap();
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 0);

        let txn = Transaction::begin(client.start_session().await.unwrap())
            .await
            .unwrap();
        coll.insert_one(to_document(json!({ "version": 1, "filename": "1.a.json" })), Some(txn.session()))
            .await
            .unwrap();
        txn.commit().await.unwrap();
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 1);

        let err = coll
            .insert_one(to_document(json!({ "version": 2, "filename": "1.a.json" })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateKey { ref index, .. } if index == "filename_1"));

        let err = coll
            .insert_one(to_document(json!({ "version": "two", "filename": "2.b.json" })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::SchemaViolation { .. }));

        coll.drop_collection().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_migrate_run() {
        let Some(address) = live_address() else {
            return;
        };
        let config = ManagerConfig::new(address, scratch_database())
            .with_collection("user", "user")
            .with_collection("migration", "migration");
        let mut manager = ConnectionManager::from_config(config).unwrap();
        manager.connect().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("1.create-db.json"),
            r#"[{ "op": "insertOne", "collection": "user", "document": { "username": "the-one" } }]"#,
        )
        .unwrap();

        let reporter = Arc::new(MemoryReporter::new());
        let migrator = Migrator::new(&manager, MigratorConfig::new(dir.path(), "migration"))
            .with_reporter(reporter.clone());
        let report = migrator.migrate().await.unwrap();
        assert_eq!(report.applied, vec!["1.create-db.json"]);
        assert!(migrator.status().await.unwrap()[0].is_applied());

        for alias in ["user", "migration"] {
            manager.collection(alias).unwrap().drop_collection().await.unwrap();
        }
        manager.close().await.unwrap();
    }
}
