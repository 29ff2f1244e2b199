//! Application configuration module
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `DOCFLOW__SECTION__KEY` environment variables (a `.env` file is loaded
//! first when present).

use crate::connection::ManagerConfig;
use crate::driver::DriverOptions;
use crate::migration::MigratorConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use validator::Validate;

const ENV_PREFIX: &str = "DOCFLOW";
const ENV_SEPARATOR: &str = "__";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(#[from] validator::ValidationErrors),
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DatabaseSettings {
    /// Driver address: `mongodb://`, `mongodb+srv://`, `memory://<name>` or
    /// `file:///path/to/store.json`
    #[validate(custom(function = "validate_address"))]
    pub address: String,

    #[validate(length(min = 1, message = "Database name is required"))]
    pub name: String,

    #[serde(default)]
    pub options: DriverOptions,

    /// Alias → collection name
    #[serde(default)]
    pub collections: BTreeMap<String, String>,
}

/// Migration configuration
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MigrationSettings {
    pub directory: PathBuf,

    #[validate(length(min = 1, message = "Tracking alias is required"))]
    pub tracking_alias: String,

    #[validate(length(min = 1, max = 120, message = "Tracking collection name must be between 1 and 120 characters"))]
    pub tracking_collection: String,
}

/// Complete application settings
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    pub database: DatabaseSettings,

    #[validate(nested)]
    pub migration: MigrationSettings,
}

impl Settings {
    /// Load settings from `.env`, the optional file and the process environment
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Self::from_sources(file, None)
    }

    /// Build settings from explicit sources.
    ///
    /// `env` replaces the process environment when given.
    pub fn from_sources(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("database.address", "memory://docflow")?
            .set_default("database.name", "docflow")?
            .set_default("migration.directory", "migrations")?
            .set_default("migration.tracking_alias", "migration")?
            .set_default("migration.tracking_collection", "migration")?;

        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .source(env),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Connection settings, with the tracking collection always exposed
    pub fn manager_config(&self) -> ManagerConfig {
        let mut collections = self.database.collections.clone();
        collections
            .entry(self.migration.tracking_alias.clone())
            .or_insert_with(|| self.migration.tracking_collection.clone());

        ManagerConfig {
            address: self.database.address.clone(),
            database: self.database.name.clone(),
            options: self.database.options.clone(),
            collections,
        }
    }

    pub fn migrator_config(&self) -> MigratorConfig {
        MigratorConfig::new(&self.migration.directory, &self.migration.tracking_alias)
    }
}

/// Only schemes with a bundled driver are accepted
fn validate_address(address: &str) -> Result<(), validator::ValidationError> {
    let valid = match address.split_once("://") {
        // Seed lists (`h1:27017,h2:27017`) are not URLs, the driver parses them
        Some(("mongodb" | "mongodb+srv", rest)) => !rest.is_empty(),
        Some(("memory" | "file", _)) => url::Url::parse(address).is_ok(),
        _ => false,
    };

    if !valid {
        let mut err = validator::ValidationError::new("invalid_address");
        err.message = Some("Address must be a mongodb://, mongodb+srv://, memory:// or file:// URL".into());
        return Err(err);
    }
    Ok(())
}
