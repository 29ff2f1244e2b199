//! docflow CLI
//!
//! ```text
//! docflow [--config docflow.toml] status
//! docflow [--config docflow.toml] migrate
//! docflow [--config docflow.toml] create <description>
//! ```

use clap::{Parser, Subcommand};
use docflow::config::Settings;
use docflow::migration::StdoutReporter;
use docflow::{ConnectionManager, MigrateResult, Migrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML configuration file, layered under DOCFLOW__* environment variables
    #[arg(short, long, env = "DOCFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show which migration files have been applied
    Status,

    /// Apply every pending migration in one transaction
    Migrate,

    /// Create the next migration file
    Create {
        /// Lowercase letters and hyphens, e.g. add-user-index
        description: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    info!("📋 Configuration loaded successfully");

    let mut manager = ConnectionManager::from_config(settings.manager_config())?;

    // Creating a file never needs the database
    if let Command::Create { description } = &cli.command {
        let migrator = Migrator::new(&manager, settings.migrator_config());
        let path = migrator.create_new_migration_file(description).await?;
        println!("{}", path.display());
        return Ok(());
    }

    manager.connect().await?;
    let result = run(&cli.command, &manager, &settings).await;
    let closed = manager.close().await;
    settle(result, closed)
}

/// Log both outcomes. The command's error wins over a close failure.
fn settle(result: anyhow::Result<()>, closed: MigrateResult<()>) -> anyhow::Result<()> {
    if let Err(e) = &result {
        error!("❌ {}", e);
    }
    if let Err(e) = &closed {
        error!("❌ Failed to close connection: {}", e);
    }
    result.and(closed.map_err(Into::into))
}

async fn run(command: &Command, manager: &ConnectionManager, settings: &Settings) -> anyhow::Result<()> {
    let migrator = Migrator::new(manager, settings.migrator_config()).with_reporter(Arc::new(StdoutReporter));

    match command {
        Command::Status => {
            let statuses = migrator.status().await?;
            let pending = statuses.iter().filter(|s| !s.is_applied()).count();
            info!("{} migration files, {} pending", statuses.len(), pending);
        }
        Command::Migrate => {
            migrator.migrate().await?;
        }
        Command::Create { .. } => {}
    }
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,docflow=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}
