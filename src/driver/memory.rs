//! In-memory document driver
//!
//! A complete implementation of the driver traits backed by process memory.
//! Addresses:
//! - `memory://<name>` keeps the store for the lifetime of the driver
//! - `file:///path/to/store.json` loads the store on connect and writes it back
//!   after every committed change
//!
//! Transactions snapshot the whole store when they start. Commit installs the
//! snapshot only if nothing else was committed in between.

use crate::driver::document::{apply_update, ensure_id, matches, Document, ID_FIELD};
use crate::driver::schema::{CollectionSchema, IndexModel};
use crate::driver::{
    ensure_connected, Client, ClientSession, Collection, CollectionHandle, Database, Driver,
    DriverOptions, UpdateResult,
};
use crate::error::{transaction_error, MigrateError, MigrateResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const ID_INDEX: &str = "_id_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    validator: Option<CollectionSchema>,
}

impl CollectionState {
    fn check_unique(&self) -> MigrateResult<()> {
        let mut seen_ids = HashSet::new();
        for doc in &self.documents {
            let id = doc.get(ID_FIELD).map(Value::to_string).unwrap_or_default();
            if !seen_ids.insert(id.clone()) {
                return Err(MigrateError::DuplicateKey {
                    index: ID_INDEX.to_string(),
                    value: id,
                });
            }
        }

        for index in self.indexes.iter().filter(|i| i.unique) {
            let mut seen = HashSet::new();
            for key in self.documents.iter().map(|doc| index.key_of(doc)) {
                let key = Value::Array(key).to_string();
                if !seen.insert(key.clone()) {
                    return Err(MigrateError::DuplicateKey {
                        index: index.name.clone(),
                        value: key,
                    });
                }
            }
        }
        Ok(())
    }

    fn validate(&self, collection: &str, doc: &Document) -> MigrateResult<()> {
        match &self.validator {
            Some(schema) => schema.validate(collection, doc),
            None => Ok(()),
        }
    }

    fn matching_positions(&self, filter: &Document, many: bool) -> MigrateResult<Vec<usize>> {
        let mut positions = Vec::new();
        for (pos, doc) in self.documents.iter().enumerate() {
            if matches(doc, filter)? {
                positions.push(pos);
                if !many {
                    break;
                }
            }
        }
        Ok(positions)
    }

    fn insert(&mut self, collection: &str, mut doc: Document) -> MigrateResult<Value> {
        let id = ensure_id(&mut doc);
        self.validate(collection, &doc)?;
        self.documents.push(doc);
        self.check_unique()?;
        Ok(id)
    }

    fn update(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        many: bool,
    ) -> MigrateResult<UpdateResult> {
        let mut result = UpdateResult::default();
        for pos in self.matching_positions(filter, many)? {
            result.matched_count += 1;
            let mut next = self.documents[pos].clone();
            apply_update(&mut next, update)?;
            if next != self.documents[pos] {
                self.validate(collection, &next)?;
                self.documents[pos] = next;
                result.modified_count += 1;
            }
        }
        self.check_unique()?;
        Ok(result)
    }

    fn delete(&mut self, filter: &Document, many: bool) -> MigrateResult<u64> {
        let positions = self.matching_positions(filter, many)?;
        for pos in positions.iter().rev() {
            self.documents.remove(*pos);
        }
        Ok(positions.len() as u64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DatabaseState {
    collections: BTreeMap<String, CollectionState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    revision: u64,
    databases: BTreeMap<String, DatabaseState>,
}

impl StoreState {
    fn collection(&self, database: &str, name: &str) -> Option<&CollectionState> {
        self.databases.get(database)?.collections.get(name)
    }

    fn collection_mut(&mut self, database: &str, name: &str) -> &mut CollectionState {
        self.databases
            .entry(database.to_string())
            .or_default()
            .collections
            .entry(name.to_string())
            .or_default()
    }
}

struct PendingTransaction {
    base_revision: u64,
    state: StoreState,
}

/// Shared store behind every client connected to the same address
struct MemoryServer {
    state: RwLock<StoreState>,
    transactions: Mutex<HashMap<Uuid, PendingTransaction>>,
    path: Option<PathBuf>,
}

impl MemoryServer {
    fn new(state: StoreState, path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(state),
            transactions: Mutex::new(HashMap::new()),
            path,
        }
    }

    async fn open_file(path: &Path) -> MigrateResult<Self> {
        let state = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(MigrateError::Connection(format!(
                    "Cannot open {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self::new(state, Some(path.to_path_buf())))
    }

    fn read<R>(
        &self,
        session: Option<&dyn ClientSession>,
        f: impl FnOnce(&StoreState) -> MigrateResult<R>,
    ) -> MigrateResult<R> {
        if let Some(session) = session {
            let transactions = self.transactions.lock();
            if let Some(pending) = transactions.get(&session.id()) {
                return f(&pending.state);
            }
        }
        f(&*self.state.read())
    }

    /// Run a write against a scratch copy and install it on success.
    ///
    /// Returns whether the live store changed (and so needs persisting).
    fn write<R>(
        &self,
        session: Option<&dyn ClientSession>,
        f: impl FnOnce(&mut StoreState) -> MigrateResult<R>,
    ) -> MigrateResult<(R, bool)> {
        if let Some(session) = session {
            let mut transactions = self.transactions.lock();
            if let Some(pending) = transactions.get_mut(&session.id()) {
                let mut scratch = pending.state.clone();
                let out = f(&mut scratch)?;
                pending.state = scratch;
                return Ok((out, false));
            }
        }

        let mut state = self.state.write();
        let mut scratch = state.clone();
        let out = f(&mut scratch)?;
        scratch.revision = state.revision + 1;
        *state = scratch;
        Ok((out, true))
    }

    async fn persist(&self) -> MigrateResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = {
            let state = self.state.read();
            serde_json::to_vec_pretty(&*state)?
        };

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Persisted store to {}", path.display());
        Ok(())
    }

    fn start_transaction(&self, id: Uuid) -> MigrateResult<()> {
        let snapshot = self.state.read().clone();
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&id) {
            return Err(transaction_error("a transaction is already in progress on this session"));
        }
        transactions.insert(
            id,
            PendingTransaction {
                base_revision: snapshot.revision,
                state: snapshot,
            },
        );
        Ok(())
    }

    fn take_transaction(&self, id: Uuid) -> MigrateResult<PendingTransaction> {
        self.transactions
            .lock()
            .remove(&id)
            .ok_or_else(|| transaction_error("no transaction in progress on this session"))
    }

    fn commit(&self, id: Uuid) -> MigrateResult<()> {
        let pending = self.take_transaction(id)?;
        let mut state = self.state.write();
        if state.revision != pending.base_revision {
            return Err(MigrateError::TransactionConflict(format!(
                "store changed during transaction (revision {} -> {})",
                pending.base_revision, state.revision
            )));
        }
        let mut next = pending.state;
        next.revision = state.revision + 1;
        *state = next;
        Ok(())
    }
}

/// Driver serving `memory://` and `file://` addresses
#[derive(Default)]
pub struct MemoryDriver {
    servers: Mutex<HashMap<String, Arc<MemoryServer>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn server_for(&self, address: &str) -> MigrateResult<Arc<MemoryServer>> {
        let url = url::Url::parse(address)
            .map_err(|e| MigrateError::Connection(format!("Invalid address {}: {}", address, e)))?;

        let cached = self.servers.lock().get(address).cloned();
        if let Some(server) = cached {
            return Ok(server);
        }

        let server = match url.scheme() {
            "memory" => MemoryServer::new(StoreState::default(), None),
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| MigrateError::Connection(format!("Invalid file address {}", address)))?;
                MemoryServer::open_file(&path).await?
            }
            other => {
                return Err(MigrateError::Connection(format!(
                    "Unsupported address scheme {}. Use memory:// or file://",
                    other
                )))
            }
        };

        // Another connect may have raced us while the file was loading
        let mut servers = self.servers.lock();
        let server = servers
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(server))
            .clone();
        Ok(server)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, address: &str, options: &DriverOptions) -> MigrateResult<Arc<dyn Client>> {
        let server = self.server_for(address).await?;
        if !options.is_empty() {
            debug!("Ignoring driver options: {:?}", options.keys().collect::<Vec<_>>());
        }
        info!("Connected to {}", address);
        Ok(Arc::new(MemoryClient {
            server,
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MemoryClient {
    server: Arc<MemoryServer>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Client for MemoryClient {
    fn database(&self, name: &str) -> Arc<dyn Database> {
        Arc::new(MemoryDatabase {
            server: self.server.clone(),
            connected: self.connected.clone(),
            name: name.to_string(),
        })
    }

    async fn start_session(&self) -> MigrateResult<Box<dyn ClientSession>> {
        ensure_connected(&self.connected)?;
        Ok(Box::new(MemorySession {
            id: Uuid::new_v4(),
            server: self.server.clone(),
        }))
    }

    async fn close(&self) -> MigrateResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.server.persist().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MemoryDatabase {
    server: Arc<MemoryServer>,
    connected: Arc<AtomicBool>,
    name: String,
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> CollectionHandle {
        Arc::new(MemoryCollection {
            server: self.server.clone(),
            connected: self.connected.clone(),
            database: self.name.clone(),
            name: name.to_string(),
        })
    }

    async fn list_collection_names(&self) -> MigrateResult<Vec<String>> {
        ensure_connected(&self.connected)?;
        self.server.read(None, |state| {
            Ok(state
                .databases
                .get(&self.name)
                .map(|db| db.collections.keys().cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn set_validator(&self, collection: &str, schema: CollectionSchema) -> MigrateResult<()> {
        ensure_connected(&self.connected)?;
        self.server.write(None, |state| {
            state.collection_mut(&self.name, collection).validator = Some(schema);
            Ok(())
        })?;
        self.server.persist().await
    }
}

struct MemoryCollection {
    server: Arc<MemoryServer>,
    connected: Arc<AtomicBool>,
    database: String,
    name: String,
}

impl MemoryCollection {
    async fn write<R: Send>(
        &self,
        session: Option<&dyn ClientSession>,
        f: impl FnOnce(&mut CollectionState) -> MigrateResult<R> + Send,
    ) -> MigrateResult<R> {
        ensure_connected(&self.connected)?;
        let (out, changed) = self
            .server
            .write(session, |state| f(state.collection_mut(&self.database, &self.name)))?;
        if changed {
            self.server.persist().await?;
        }
        Ok(out)
    }

    fn read<R>(
        &self,
        session: Option<&dyn ClientSession>,
        f: impl FnOnce(Option<&CollectionState>) -> MigrateResult<R>,
    ) -> MigrateResult<R> {
        ensure_connected(&self.connected)?;
        self.server
            .read(session, |state| f(state.collection(&self.database, &self.name)))
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Vec<Document>> {
        self.read(session, |coll| {
            let Some(coll) = coll else {
                return Ok(Vec::new());
            };
            let mut found = Vec::new();
            for doc in &coll.documents {
                if matches(doc, &filter)? {
                    found.push(doc.clone());
                }
            }
            Ok(found)
        })
    }

    async fn find_one(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Option<Document>> {
        self.read(session, |coll| {
            let Some(coll) = coll else {
                return Ok(None);
            };
            for doc in &coll.documents {
                if matches(doc, &filter)? {
                    return Ok(Some(doc.clone()));
                }
            }
            Ok(None)
        })
    }

    async fn insert_one(
        &self,
        document: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Value> {
        let name = self.name.clone();
        self.write(session, move |coll| coll.insert(&name, document))
            .await
    }

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<Vec<Value>> {
        let name = self.name.clone();
        self.write(session, move |coll| {
            documents
                .into_iter()
                .map(|doc| coll.insert(&name, doc))
                .collect::<MigrateResult<Vec<_>>>()
        })
        .await
    }

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<UpdateResult> {
        let name = self.name.clone();
        self.write(session, move |coll| coll.update(&name, &filter, &update, false))
            .await
    }

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<UpdateResult> {
        let name = self.name.clone();
        self.write(session, move |coll| coll.update(&name, &filter, &update, true))
            .await
    }

    async fn delete_one(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64> {
        self.write(session, move |coll| coll.delete(&filter, false)).await
    }

    async fn delete_many(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64> {
        self.write(session, move |coll| coll.delete(&filter, true)).await
    }

    async fn count_documents(
        &self,
        filter: Document,
        session: Option<&dyn ClientSession>,
    ) -> MigrateResult<u64> {
        Ok(self.find(filter, session).await?.len() as u64)
    }

    async fn create_index(&self, index: IndexModel) -> MigrateResult<String> {
        let name = index.name.clone();
        self.write(None, move |coll| {
            if let Some(existing) = coll.indexes.iter().find(|i| i.name == index.name) {
                if *existing == index {
                    return Ok(());
                }
                return Err(MigrateError::InvalidQuery(format!(
                    "index {} already exists with different options",
                    index.name
                )));
            }
            coll.indexes.push(index);
            coll.check_unique()
        })
        .await?;
        debug!("Index {} ready on {}", name, self.name);
        Ok(name)
    }

    async fn drop_collection(&self) -> MigrateResult<()> {
        ensure_connected(&self.connected)?;
        self.server.write(None, |state| {
            if let Some(db) = state.databases.get_mut(&self.database) {
                db.collections.remove(&self.name);
            }
            Ok(())
        })?;
        self.server.persist().await
    }
}

struct MemorySession {
    id: Uuid,
    server: Arc<MemoryServer>,
}

#[async_trait]
impl ClientSession for MemorySession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn in_transaction(&self) -> bool {
        self.server.transactions.lock().contains_key(&self.id)
    }

    async fn start_transaction(&self) -> MigrateResult<()> {
        self.server.start_transaction(self.id)
    }

    async fn commit_transaction(&self) -> MigrateResult<()> {
        self.server.commit(self.id)?;
        self.server.persist().await
    }

    async fn abort_transaction(&self) -> MigrateResult<()> {
        self.server.take_transaction(self.id).map(|_| ())
    }

    fn abandon(&self) {
        self.server.transactions.lock().remove(&self.id);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::document::to_document;
    use crate::driver::Transaction;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn connect(driver: &MemoryDriver) -> Arc<dyn Client> {
        driver
            .connect("memory://test", &DriverOptions::new())
            .await
            .unwrap()
    }

    fn usernames(docs: &[Document]) -> Vec<String> {
        docs.iter()
            .filter_map(|d| d.get("username").and_then(Value::as_str).map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_find_update_delete() {
        let driver = MemoryDriver::new();
        let users = connect(&driver).await.database("app").collection("user");

        users
            .insert_many(
                vec![
                    to_document(json!({ "username": "a" })),
                    to_document(json!({ "username": "b" })),
                ],
                None,
            )
            .await
            .unwrap();

        let result = users
            .update_one(
                to_document(json!({ "username": "a" })),
                to_document(json!({ "$set": { "username": "c" } })),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { matched_count: 1, modified_count: 1 });

        let all = users.find(Document::new(), None).await.unwrap();
        assert_eq!(usernames(&all), vec!["c", "b"]);

        let deleted = users.delete_many(Document::new(), None).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(users.count_documents(Document::new(), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let driver = MemoryDriver::new();
        let coll = connect(&driver).await.database("app").collection("migration");
        coll.create_index(IndexModel::unique("filename")).await.unwrap();
        // Creating the same index again is a no-op
        coll.create_index(IndexModel::unique("filename")).await.unwrap();

        coll.insert_one(to_document(json!({ "filename": "1.a.json" })), None)
            .await
            .unwrap();
        let err = coll
            .insert_one(to_document(json!({ "filename": "1.a.json" })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateKey { ref index, .. } if index == "filename_1"));
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_index_creation_fails_on_existing_duplicates() {
        let driver = MemoryDriver::new();
        let coll = connect(&driver).await.database("app").collection("c");
        coll.insert_many(
            vec![to_document(json!({ "v": 1 })), to_document(json!({ "v": 1 }))],
            None,
        )
        .await
        .unwrap();
        assert!(coll.create_index(IndexModel::unique("v")).await.is_err());
    }

    #[tokio::test]
    async fn test_unique_index_allows_one_document_without_the_field() {
        let driver = MemoryDriver::new();
        let coll = connect(&driver).await.database("app").collection("c");
        coll.create_index(IndexModel::unique("v")).await.unwrap();

        coll.insert_one(to_document(json!({ "other": 1 })), None)
            .await
            .unwrap();
        let err = coll
            .insert_one(to_document(json!({ "other": 2 })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateKey { ref value, .. } if value == "[null]"));
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_collection_removes_documents_indexes_and_validator() {
        let driver = MemoryDriver::new();
        let db = connect(&driver).await.database("app");
        let coll = db.collection("migration");
        coll.create_index(IndexModel::unique("v")).await.unwrap();
        db.set_validator("migration", CollectionSchema::new().require("v", crate::driver::FieldKind::Int))
            .await
            .unwrap();
        coll.insert_one(to_document(json!({ "v": 1 })), None)
            .await
            .unwrap();

        coll.drop_collection().await.unwrap();
        assert!(db.list_collection_names().await.unwrap().is_empty());

        // Neither the index nor the validator survive
        coll.insert_many(
            vec![to_document(json!({ "v": "a" })), to_document(json!({ "v": "a" }))],
            None,
        )
        .await
        .unwrap();
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transaction_commit_makes_writes_visible() {
        let driver = MemoryDriver::new();
        let client = connect(&driver).await;
        let users = client.database("app").collection("user");

        let txn = Transaction::begin(client.start_session().await.unwrap())
            .await
            .unwrap();
        users
            .insert_one(to_document(json!({ "username": "inside" })), Some(txn.session()))
            .await
            .unwrap();

        // Invisible outside the transaction, visible inside it
        assert_eq!(users.count_documents(Document::new(), None).await.unwrap(), 0);
        assert_eq!(
            users
                .count_documents(Document::new(), Some(txn.session()))
                .await
                .unwrap(),
            1
        );

        txn.commit().await.unwrap();
        assert_eq!(users.count_documents(Document::new(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transaction_abort_and_drop_discard_writes() {
        let driver = MemoryDriver::new();
        let client = connect(&driver).await;
        let users = client.database("app").collection("user");

        let txn = Transaction::begin(client.start_session().await.unwrap())
            .await
            .unwrap();
        users
            .insert_one(to_document(json!({ "username": "x" })), Some(txn.session()))
            .await
            .unwrap();
        txn.abort().await.unwrap();

        {
            let txn = Transaction::begin(client.start_session().await.unwrap())
                .await
                .unwrap();
            users
                .insert_one(to_document(json!({ "username": "y" })), Some(txn.session()))
                .await
                .unwrap();
        }

        assert_eq!(users.count_documents(Document::new(), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_write_conflicts_on_commit() {
        let driver = MemoryDriver::new();
        let client = connect(&driver).await;
        let users = client.database("app").collection("user");

        let txn = Transaction::begin(client.start_session().await.unwrap())
            .await
            .unwrap();
        users
            .insert_one(to_document(json!({ "username": "txn" })), Some(txn.session()))
            .await
            .unwrap();
        users
            .insert_one(to_document(json!({ "username": "outside" })), None)
            .await
            .unwrap();

        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, MigrateError::TransactionConflict(_)));
        let all = users.find(Document::new(), None).await.unwrap();
        assert_eq!(usernames(&all), vec!["outside"]);
    }

    #[tokio::test]
    async fn test_second_transaction_on_same_session_is_rejected() {
        let driver = MemoryDriver::new();
        let client = connect(&driver).await;
        let session = client.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        assert!(session.in_transaction());
        assert!(session.start_transaction().await.is_err());
        session.abort_transaction().await.unwrap();
        assert!(!session.in_transaction());
        assert!(session.abort_transaction().await.is_err());
    }

    #[tokio::test]
    async fn test_validator_applies_to_new_writes() {
        let driver = MemoryDriver::new();
        let db = connect(&driver).await.database("app");
        let coll = db.collection("migration");
        db.set_validator(
            "migration",
            CollectionSchema::new().require("version", crate::driver::FieldKind::Int),
        )
        .await
        .unwrap();

        let err = coll
            .insert_one(to_document(json!({ "version": "one" })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::SchemaViolation { .. }));
        coll.insert_one(to_document(json!({ "version": 1 })), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_client_revokes_handles() {
        let driver = MemoryDriver::new();
        let client = connect(&driver).await;
        let coll = client.database("app").collection("user");
        client.close().await.unwrap();
        assert!(!client.is_connected());

        let err = coll.find(Document::new(), None).await.unwrap_err();
        assert!(matches!(err, MigrateError::NotConnected(_)));
        assert!(client.start_session().await.is_err());
        // Closing twice is fine
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_sees_previous_data() {
        let driver = MemoryDriver::new();
        let client = connect(&driver).await;
        client
            .database("app")
            .collection("user")
            .insert_one(to_document(json!({ "username": "kept" })), None)
            .await
            .unwrap();
        client.close().await.unwrap();

        let client = connect(&driver).await;
        let all = client
            .database("app")
            .collection("user")
            .find(Document::new(), None)
            .await
            .unwrap();
        assert_eq!(usernames(&all), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let address = url::Url::from_file_path(&path).unwrap().to_string();

        let client = MemoryDriver::new()
            .connect(&address, &DriverOptions::new())
            .await
            .unwrap();
        client
            .database("app")
            .collection("user")
            .insert_one(to_document(json!({ "_id": "u1", "username": "saved" })), None)
            .await
            .unwrap();
        client.close().await.unwrap();
        assert!(path.exists());

        // A fresh driver has no cached server, so this reads the file
        let client = MemoryDriver::new()
            .connect(&address, &DriverOptions::new())
            .await
            .unwrap();
        let doc = client
            .database("app")
            .collection("user")
            .find_one(to_document(json!({ "_id": "u1" })), None)
            .await
            .unwrap();
        assert_eq!(
            doc.map(Value::Object),
            Some(json!({ "_id": "u1", "username": "saved" }))
        );
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let result = MemoryDriver::new()
            .connect("mongodb://localhost:27017", &DriverOptions::new())
            .await;
        assert!(matches!(result, Err(MigrateError::Connection(_))));
    }
}
