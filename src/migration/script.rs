//! JSON migration scripts
//!
//! A script is a JSON array of steps run in order against the manager's
//! collection aliases:
//!
//! ```json
//! [
//!   { "op": "insertOne", "collection": "user", "document": { "username": "the-one" } },
//!   { "op": "updateOne", "collection": "user",
//!     "filter": { "username": "the-one" }, "update": { "$set": { "active": true } } }
//! ]
//! ```
//!
//! An empty array is a valid no-op script and is what new migration files
//! start with.

use crate::connection::ConnectionManager;
use crate::driver::{ClientSession, Document};
use crate::error::{MigrateError, MigrateResult};
use crate::migration::loader::{Migration, MigrationLoader};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Content of a freshly generated migration file
pub const SCRIPT_TEMPLATE: &str = "[]\n";

/// One step of a script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", deny_unknown_fields)]
pub enum ScriptStep {
    InsertOne {
        collection: String,
        document: Document,
    },
    InsertMany {
        collection: String,
        documents: Vec<Document>,
    },
    UpdateOne {
        collection: String,
        #[serde(default)]
        filter: Document,
        update: Document,
    },
    UpdateMany {
        collection: String,
        #[serde(default)]
        filter: Document,
        update: Document,
    },
    DeleteOne {
        collection: String,
        #[serde(default)]
        filter: Document,
    },
    DeleteMany {
        collection: String,
        #[serde(default)]
        filter: Document,
    },
}

impl ScriptStep {
    pub fn collection(&self) -> &str {
        match self {
            ScriptStep::InsertOne { collection, .. }
            | ScriptStep::InsertMany { collection, .. }
            | ScriptStep::UpdateOne { collection, .. }
            | ScriptStep::UpdateMany { collection, .. }
            | ScriptStep::DeleteOne { collection, .. }
            | ScriptStep::DeleteMany { collection, .. } => collection,
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            ScriptStep::InsertMany { documents, .. } if documents.is_empty() => {
                Err("insertMany needs at least one document".to_string())
            }
            ScriptStep::UpdateOne { update, .. } | ScriptStep::UpdateMany { update, .. } if update.is_empty() => {
                Err("update must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }

    async fn run(&self, manager: &ConnectionManager, session: &dyn ClientSession) -> MigrateResult<()> {
        let collection = manager.collection(self.collection())?;
        let session = Some(session);
        match self {
            ScriptStep::InsertOne { document, .. } => {
                collection.insert_one(document.clone(), session).await?;
            }
            ScriptStep::InsertMany { documents, .. } => {
                collection.insert_many(documents.clone(), session).await?;
            }
            ScriptStep::UpdateOne { filter, update, .. } => {
                collection
                    .update_one(filter.clone(), update.clone(), session)
                    .await?;
            }
            ScriptStep::UpdateMany { filter, update, .. } => {
                collection
                    .update_many(filter.clone(), update.clone(), session)
                    .await?;
            }
            ScriptStep::DeleteOne { filter, .. } => {
                collection.delete_one(filter.clone(), session).await?;
            }
            ScriptStep::DeleteMany { filter, .. } => {
                collection.delete_many(filter.clone(), session).await?;
            }
        }
        Ok(())
    }
}

/// A parsed script
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMigration {
    pub filename: String,
    pub steps: Vec<ScriptStep>,
}

impl ScriptMigration {
    /// Parse and check a script's source
    pub fn parse(filename: &str, source: &str) -> MigrateResult<Self> {
        let invalid = |reason: String| MigrateError::InvalidScript {
            filename: filename.to_string(),
            reason,
        };

        let steps: Vec<ScriptStep> = serde_json::from_str(source).map_err(|e| invalid(e.to_string()))?;
        for (i, step) in steps.iter().enumerate() {
            step.check().map_err(|reason| invalid(format!("step {}: {}", i + 1, reason)))?;
        }

        Ok(Self {
            filename: filename.to_string(),
            steps,
        })
    }
}

#[async_trait]
impl Migration for ScriptMigration {
    async fn apply(&self, manager: &ConnectionManager, session: &dyn ClientSession) -> MigrateResult<()> {
        for (i, step) in self.steps.iter().enumerate() {
            debug!("{} step {}: {:?}", self.filename, i + 1, step);
            step.run(manager, session).await?;
        }
        Ok(())
    }
}

/// Loads migrations by reading and parsing the script file
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptLoader;

#[async_trait]
impl MigrationLoader for ScriptLoader {
    async fn load(&self, directory: &Path, filename: &str) -> MigrateResult<Arc<dyn Migration>> {
        let source = tokio::fs::read_to_string(directory.join(filename)).await?;
        Ok(Arc::new(ScriptMigration::parse(filename, &source)?))
    }
}
