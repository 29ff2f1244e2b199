//! Error handling module
//!
//! Provides the unified error type shared by the driver layer, the connection
//! manager and the migration engine.

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Invalid migration filename {0}")]
    InvalidFilename(String),

    #[error("Duplicated migration version {0}")]
    DuplicateVersion(u64),

    #[error("Invalid migration filename description {0}")]
    InvalidDescription(String),

    #[error("Migration version {0} is the largest possible, no next version")]
    VersionOverflow(u64),

    #[error("Migration {filename} failed: {source}")]
    MigrationFailed {
        filename: String,
        #[source]
        source: Box<MigrateError>,
    },

    #[error("No migration registered for {0}")]
    MissingMigration(String),

    #[error("Invalid migration script {filename}: {reason}")]
    InvalidScript { filename: String, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection not established: {0}")]
    NotConnected(String),

    #[error("Manager is already connected to {0}")]
    AlreadyConnected(String),

    #[error("Unknown collection alias: {0}")]
    UnknownCollection(String),

    #[error("Duplicate key on index {index}: {value}")]
    DuplicateKey { index: String, value: String },

    #[error("Document failed validation for {collection}: {reason}")]
    SchemaViolation { collection: String, reason: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MigrateError {
    /// Wrap a failure raised while applying a migration body
    pub fn migration_failed(filename: impl Into<String>, source: MigrateError) -> Self {
        MigrateError::MigrationFailed {
            filename: filename.into(),
            source: Box::new(source),
        }
    }

    /// Short machine-readable code, used in log fields
    pub fn code(&self) -> &'static str {
        match self {
            MigrateError::InvalidFilename(_) => "INVALID_FILENAME",
            MigrateError::DuplicateVersion(_) => "DUPLICATE_VERSION",
            MigrateError::InvalidDescription(_) => "INVALID_DESCRIPTION",
            MigrateError::VersionOverflow(_) => "VERSION_OVERFLOW",
            MigrateError::MigrationFailed { .. } => "MIGRATION_FAILED",
            MigrateError::MissingMigration(_) => "MISSING_MIGRATION",
            MigrateError::InvalidScript { .. } => "INVALID_SCRIPT",
            MigrateError::Connection(_) => "CONNECTION_ERROR",
            MigrateError::NotConnected(_) => "NOT_CONNECTED",
            MigrateError::AlreadyConnected(_) => "ALREADY_CONNECTED",
            MigrateError::UnknownCollection(_) => "UNKNOWN_COLLECTION",
            MigrateError::DuplicateKey { .. } => "DUPLICATE_KEY",
            MigrateError::SchemaViolation { .. } => "SCHEMA_VIOLATION",
            MigrateError::Transaction(_) => "TRANSACTION_ERROR",
            MigrateError::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            MigrateError::InvalidQuery(_) => "INVALID_QUERY",
            MigrateError::Database(_) => "DATABASE_ERROR",
            MigrateError::Io(_) => "IO_ERROR",
            MigrateError::Serialization(_) => "SERIALIZATION_ERROR",
            MigrateError::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Result type alias used throughout the crate
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Helper function to create an invalid query error
pub fn invalid_query(msg: impl Into<String>) -> MigrateError {
    MigrateError::InvalidQuery(msg.into())
}

/// Helper function to create a transaction error
pub fn transaction_error(msg: impl Into<String>) -> MigrateError {
    MigrateError::Transaction(msg.into())
}
