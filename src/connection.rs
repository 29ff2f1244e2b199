//! Database Connection Manager
//!
//! Owns the driver client for one logical database and exposes the configured
//! collections under short aliases. Handles exist only while connected.

use crate::driver::{
    Client, ClientSession, CollectionHandle, Database, Driver, DriverOptions, MemoryDriver, MongoDriver,
};
use crate::error::{MigrateError, MigrateResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// `scheme://user:password@` prefix; multi-host MongoDB addresses are not URLs
static CREDENTIALS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*://[^:/@]*:)[^@/]*@").unwrap());

/// What the manager connects to and which collections it exposes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Driver address, e.g. `mongodb://db.local:27017/?replicaSet=rs0`,
    /// `memory://dev` or `file:///var/lib/app/store.json`
    pub address: String,
    pub database: String,
    /// Passed to the driver untouched
    #[serde(default)]
    pub options: DriverOptions,
    /// Alias → physical collection name
    #[serde(default)]
    pub collections: BTreeMap<String, String>,
}

impl ManagerConfig {
    pub fn new(address: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Expose `name` under `alias`
    pub fn with_collection(mut self, alias: impl Into<String>, name: impl Into<String>) -> Self {
        self.collections.insert(alias.into(), name.into());
        self
    }

    /// Address with any password masked, safe for logs
    pub fn display_address(&self) -> String {
        CREDENTIALS.replace(&self.address, "${1}****@").into_owned()
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Public connection info
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub address: String,
    pub database: String,
    pub driver: String,
    pub status: ConnectionStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub collections: Vec<String>,
}

struct Connected {
    client: Arc<dyn Client>,
    database: Arc<dyn Database>,
    collections: HashMap<String, CollectionHandle>,
    connected_at: DateTime<Utc>,
}

/// Connection Manager - one client, one database, aliased collections
pub struct ConnectionManager {
    config: ManagerConfig,
    driver: Arc<dyn Driver>,
    connected: Option<Connected>,
}

impl ConnectionManager {
    /// Create a disconnected manager
    pub fn new(config: ManagerConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            config,
            driver,
            connected: None,
        }
    }

    /// Create a manager with the bundled driver matching the address scheme
    pub fn from_config(config: ManagerConfig) -> MigrateResult<Self> {
        let scheme = config
            .address
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| MigrateError::Config(format!("Invalid address {}", config.display_address())))?;

        let driver: Arc<dyn Driver> = match scheme {
            "mongodb" | "mongodb+srv" => Arc::new(MongoDriver::new()),
            "memory" | "file" => Arc::new(MemoryDriver::new()),
            other => {
                return Err(MigrateError::Config(format!(
                    "No driver available for {}://. Use mongodb://, mongodb+srv://, memory:// or file://",
                    other
                )))
            }
        };
        Ok(Self::new(config, driver))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Connect and bind every configured collection
    pub async fn connect(&mut self) -> MigrateResult<()> {
        if self.connected.is_some() {
            return Err(MigrateError::AlreadyConnected(self.config.display_address()));
        }

        let client = self
            .driver
            .connect(&self.config.address, &self.config.options)
            .await?;
        let database = client.database(&self.config.database);

        let collections = self
            .config
            .collections
            .iter()
            .map(|(alias, name)| {
                debug!("Binding collection {} as {}", name, alias);
                (alias.clone(), database.collection(name))
            })
            .collect();

        self.connected = Some(Connected {
            client,
            database,
            collections,
            connected_at: Utc::now(),
        });

        info!(
            "🔌 Connected to {} (database: {}, driver: {})",
            self.config.display_address(),
            self.config.database,
            self.driver.name()
        );
        Ok(())
    }

    /// Close the client and drop every handle. Safe to call when not connected.
    pub async fn close(&mut self) -> MigrateResult<()> {
        let Some(connected) = self.connected.take() else {
            return Ok(());
        };
        connected.client.close().await?;
        info!("Disconnected from {}", self.config.display_address());
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    fn connected(&self) -> MigrateResult<&Connected> {
        self.connected
            .as_ref()
            .ok_or_else(|| MigrateError::NotConnected(self.config.display_address()))
    }

    /// Handle bound to `alias`
    pub fn collection(&self, alias: &str) -> MigrateResult<CollectionHandle> {
        self.connected()?
            .collections
            .get(alias)
            .cloned()
            .ok_or_else(|| MigrateError::UnknownCollection(alias.to_string()))
    }

    pub fn database(&self) -> MigrateResult<Arc<dyn Database>> {
        Ok(self.connected()?.database.clone())
    }

    pub fn client(&self) -> MigrateResult<Arc<dyn Client>> {
        Ok(self.connected()?.client.clone())
    }

    /// Configured aliases, sorted
    pub fn aliases(&self) -> Vec<&str> {
        self.config.collections.keys().map(String::as_str).collect()
    }

    pub async fn start_session(&self) -> MigrateResult<Box<dyn ClientSession>> {
        self.connected()?.client.start_session().await
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: self.config.display_address(),
            database: self.config.database.clone(),
            driver: self.driver.name().to_string(),
            status: if self.is_connected() {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            },
            connected_at: self.connected.as_ref().map(|c| c.connected_at),
            collections: self.aliases().into_iter().map(String::from).collect(),
        }
    }
}
