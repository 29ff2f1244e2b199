//! Migration bodies and the loaders that resolve them from filenames

use crate::connection::ConnectionManager;
use crate::driver::ClientSession;
use crate::error::{MigrateError, MigrateResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// The body of one migration.
///
/// Writes must pass `session` so they join the run's transaction.
#[async_trait]
pub trait Migration: Send + Sync {
    async fn apply(&self, manager: &ConnectionManager, session: &dyn ClientSession) -> MigrateResult<()>;
}

/// Resolves a migration filename to its body
#[async_trait]
pub trait MigrationLoader: Send + Sync {
    async fn load(&self, directory: &Path, filename: &str) -> MigrateResult<Arc<dyn Migration>>;
}

/// Migrations compiled into the binary, keyed by filename.
///
/// The file on disk still decides ordering and versioning; its content is not
/// read.
#[derive(Default, Clone)]
pub struct StaticLoader {
    migrations: HashMap<String, Arc<dyn Migration>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body for `filename`, replacing any previous one
    pub fn register(mut self, filename: impl Into<String>, migration: impl Migration + 'static) -> Self {
        self.migrations.insert(filename.into(), Arc::new(migration));
        self
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[async_trait]
impl MigrationLoader for StaticLoader {
    async fn load(&self, _directory: &Path, filename: &str) -> MigrateResult<Arc<dyn Migration>> {
        self.migrations
            .get(filename)
            .cloned()
            .ok_or_else(|| MigrateError::MissingMigration(filename.to_string()))
    }
}
