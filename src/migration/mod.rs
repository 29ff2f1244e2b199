//! Versioned migrations
//!
//! - Registry: filename parsing, validation and ordering
//! - Loaders: turning a filename into a runnable body
//! - Migrator: applying pending files in one transaction and tracking them

pub mod loader;
pub mod migrator;
pub mod registry;
pub mod report;
pub mod script;

pub use loader::{Migration, MigrationLoader, StaticLoader};
pub use migrator::{MigrationRecord, MigrationReport, MigrationStatus, Migrator, MigratorConfig};
pub use registry::MigrationFile;
pub use report::{MemoryReporter, Reporter, StdoutReporter, TracingReporter};
pub use script::{ScriptLoader, ScriptMigration, ScriptStep};
