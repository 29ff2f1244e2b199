//! Migration engine
//!
//! Applies the migration files of a directory in version order, all inside a
//! single transaction, and records each applied file in a tracking
//! collection. A file with a tracking record is never applied again.

use crate::connection::ConnectionManager;
use crate::driver::{
    to_document, ClientSession, CollectionHandle, CollectionSchema, Document, FieldKind, IndexModel,
    Transaction,
};
use crate::error::{MigrateError, MigrateResult};
use crate::migration::loader::MigrationLoader;
use crate::migration::registry::{self, MigrationFile, CANONICAL_FILENAME_PATTERN};
use crate::migration::report::{Reporter, TracingReporter};
use crate::migration::script::{ScriptLoader, SCRIPT_TEMPLATE};
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const NO_MIGRATION_FILES: &str = "There are no migration files";

/// Where migration files live and where applied ones are recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigratorConfig {
    pub migration_directory: PathBuf,
    /// Manager alias of the tracking collection
    pub tracking_alias: String,
}

impl MigratorConfig {
    pub fn new(migration_directory: impl Into<PathBuf>, tracking_alias: impl Into<String>) -> Self {
        Self {
            migration_directory: migration_directory.into(),
            tracking_alias: tracking_alias.into(),
        }
    }
}

/// Tracking record of an applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: u64,
    pub filename: String,
    pub applied_time: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn to_document(&self) -> Document {
        to_document(json!({
            "version": self.version,
            "filename": self.filename,
            "appliedTime": format_time(&self.applied_time),
        }))
    }

    pub fn from_document(doc: Document) -> MigrateResult<Self> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }
}

/// Per-file status as reported by [`Migrator::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub version: u64,
    pub filename: String,
    pub applied_time: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_time.is_some()
    }
}

/// Outcome of a successful [`Migrator::migrate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Files applied by this run, in order
    pub applied: Vec<String>,
    /// Files already recorded before this run, in order
    pub skipped: Vec<String>,
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time at microsecond precision, strictly after `previous`
fn next_applied_time(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}

/// The migration engine
pub struct Migrator<'a> {
    manager: &'a ConnectionManager,
    config: MigratorConfig,
    loader: Arc<dyn MigrationLoader>,
    reporter: Arc<dyn Reporter>,
}

impl<'a> Migrator<'a> {
    /// Engine reading JSON scripts and reporting through tracing
    pub fn new(manager: &'a ConnectionManager, config: MigratorConfig) -> Self {
        Self {
            manager,
            config,
            loader: Arc::new(ScriptLoader),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn MigrationLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    fn directory(&self) -> &Path {
        &self.config.migration_directory
    }

    fn tracking(&self) -> MigrateResult<CollectionHandle> {
        self.manager.collection(&self.config.tracking_alias)
    }

    fn report(&self, line: &str) {
        self.reporter.report(line);
    }

    /// Write `<next version>.<description>.json` holding an empty script.
    ///
    /// Creates the migration directory when it is missing. Never touches the
    /// database.
    pub async fn create_new_migration_file(&self, description: &str) -> MigrateResult<PathBuf> {
        if !registry::is_valid_description(description) {
            return Err(MigrateError::InvalidDescription(description.to_string()));
        }

        tokio::fs::create_dir_all(self.directory()).await?;
        let version = registry::next_version(self.directory()).await?;
        let path = self
            .directory()
            .join(MigrationFile::file_name_for(version, description));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(SCRIPT_TEMPLATE.as_bytes()).await?;
        file.flush().await?;

        info!("📝 Created migration file {}", path.display());
        Ok(path)
    }

    /// Report whether each migration file has been applied. Read-only.
    pub async fn status(&self) -> MigrateResult<Vec<MigrationStatus>> {
        let files = registry::load_ordered(self.directory()).await?;
        if files.is_empty() {
            self.report(NO_MIGRATION_FILES);
            return Ok(Vec::new());
        }

        let tracking = self.tracking()?;
        let mut statuses = Vec::with_capacity(files.len());
        for file in files {
            let record = find_record(&tracking, &file.filename, None).await?;
            match &record {
                Some(record) => self.report(&format!(
                    "{}: applied at {}",
                    file.filename,
                    format_time(&record.applied_time)
                )),
                None => self.report(&format!("{}: -", file.filename)),
            }
            statuses.push(MigrationStatus {
                version: file.version,
                filename: file.filename,
                applied_time: record.map(|r| r.applied_time),
            });
        }
        Ok(statuses)
    }

    /// Apply every pending migration in one transaction.
    ///
    /// The directory is validated before the database is touched. Any failure
    /// aborts the whole run, leaving neither migration writes nor tracking
    /// records behind.
    pub async fn migrate(&self) -> MigrateResult<MigrationReport> {
        let files = registry::load_ordered(self.directory()).await?;
        if files.is_empty() {
            self.report(NO_MIGRATION_FILES);
            return Ok(MigrationReport::default());
        }

        let tracking = self.tracking()?;
        self.prepare_tracking(&tracking).await?;

        let txn = Transaction::begin(self.manager.start_session().await?).await?;
        let result = self.apply_all(&files, &tracking, txn.session()).await;
        let report = txn.finish(result).await?;

        info!(
            "✅ Migration run complete: {} applied, {} already applied",
            report.applied.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Unique indexes and the record schema, installed outside the transaction
    async fn prepare_tracking(&self, tracking: &CollectionHandle) -> MigrateResult<()> {
        tracking.create_index(IndexModel::unique("filename")).await?;
        tracking.create_index(IndexModel::unique("version")).await?;

        let schema = CollectionSchema::new()
            .require("version", FieldKind::Int)
            .require_pattern("filename", CANONICAL_FILENAME_PATTERN)
            .require("appliedTime", FieldKind::Timestamp);
        self.manager
            .database()?
            .set_validator(tracking.name(), schema)
            .await?;

        debug!("Tracking collection {} prepared", tracking.name());
        Ok(())
    }

    async fn apply_all(
        &self,
        files: &[MigrationFile],
        tracking: &CollectionHandle,
        session: &dyn ClientSession,
    ) -> MigrateResult<MigrationReport> {
        let mut report = MigrationReport::default();
        let mut last_applied = None;

        for file in files {
            self.report(&file.filename);

            if let Some(record) = find_record(tracking, &file.filename, Some(session)).await? {
                self.report(&format!("  already applied at {}", format_time(&record.applied_time)));
                report.skipped.push(file.filename.clone());
                continue;
            }

            if !registry::is_canonical_filename(&file.filename) {
                warn!(
                    "{} does not match {}, its tracking record will be rejected",
                    file.filename, CANONICAL_FILENAME_PATTERN
                );
            }

            let applied_time = next_applied_time(last_applied);
            self.apply_file(file, tracking, session, applied_time)
                .await
                .map_err(|e| {
                    warn!(code = e.code(), "Migration {} failed: {}", file.filename, e);
                    MigrateError::migration_failed(&file.filename, e)
                })?;

            last_applied = Some(applied_time);
            report.applied.push(file.filename.clone());
        }
        Ok(report)
    }

    async fn apply_file(
        &self,
        file: &MigrationFile,
        tracking: &CollectionHandle,
        session: &dyn ClientSession,
        applied_time: DateTime<Utc>,
    ) -> MigrateResult<()> {
        self.report("  is being read ...");
        let migration = self.loader.load(self.directory(), &file.filename).await?;
        self.report("    done");

        self.report("  is being applied ...");
        migration.apply(self.manager, session).await?;
        self.report("    done");

        self.report("  is being saved ...");
        let record = MigrationRecord {
            version: file.version,
            filename: file.filename.clone(),
            applied_time,
        };
        tracking.insert_one(record.to_document(), Some(session)).await?;
        self.report("    done");
        Ok(())
    }
}

async fn find_record(
    tracking: &CollectionHandle,
    filename: &str,
    session: Option<&dyn ClientSession>,
) -> MigrateResult<Option<MigrationRecord>> {
    tracking
        .find_one(to_document(json!({ "filename": filename })), session)
        .await?
        .map(MigrationRecord::from_document)
        .transpose()
}
