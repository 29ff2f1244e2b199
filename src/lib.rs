//! docflow - versioned migrations for document databases
//!
//! - `driver`: the document database interface, a MongoDB driver and an in-memory driver
//! - `connection`: one client, one database, collections under aliases
//! - `migration`: filename-versioned migrations applied in a single transaction
//! - `snapshot`: before/after comparison of collections around an action

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod migration;
pub mod snapshot;

pub use connection::{ConnectionManager, ManagerConfig};
pub use error::{MigrateError, MigrateResult};
pub use migration::{Migrator, MigratorConfig};
pub use snapshot::{are_same_documents, compare_after_action, Comparison};
