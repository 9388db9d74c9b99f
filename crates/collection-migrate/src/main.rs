//! collection-migrate CLI
//!
//! Command-line tool for managing collection migrations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use collection_migrate::document;
use collection_migrate::prelude::*;

/// Collection schema migrations for backend-as-a-service stores.
#[derive(Parser)]
#[command(name = "collection-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:pb_data/data.db")]
    database: String,

    /// Migrations directory.
    #[arg(short, long, env = "MIGRATIONS_DIR", default_value = "pb_migrations")]
    migrations_dir: PathBuf,

    /// Seconds to wait for the migration lock.
    #[arg(long, default_value_t = 30)]
    lock_timeout: u64,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the catalog, ledger and lock tables.
    Init,

    /// Apply pending migrations.
    Up {
        /// Number of migrations to apply (all if not specified).
        #[arg(short, long)]
        count: Option<usize>,

        /// Replay migrations on a detached catalog without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Revert applied migrations, newest first.
    Down {
        /// Number of migrations to revert.
        #[arg(short, long, default_value_t = 1)]
        steps: usize,
    },

    /// Show migration status.
    Status,

    /// Reconcile a collections file against the live catalog.
    Import {
        /// JSON file holding an array of collections.
        file: PathBuf,

        /// Delete collections that are not in the file.
        #[arg(long)]
        delete_missing: bool,

        /// Treat a field id that reappears under a new name as a rename.
        #[arg(long)]
        match_field_ids: bool,

        /// Show the changes without applying them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the live catalog as JSON.
    Collections,
}

fn load_migrations(dir: &Path) -> anyhow::Result<Vec<Migration>> {
    let mut migrations = builtin_migrations()?;
    migrations.extend(load_dir(dir)?);
    Ok(migrations)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let backend = SqliteBackend::connect(&cli.database).await?;
    backend.ensure_tables().await?;
    let lock_timeout = Duration::from_secs(cli.lock_timeout);

    match cli.command {
        Commands::Init => {
            info!(database = %cli.database, "Store tables are ready");
        }

        Commands::Up { count, dry_run } => {
            let migrations = load_migrations(&cli.migrations_dir)?;
            let runner = MigrationRunner::new(backend, migrations)?
                .with_lock_timeout(lock_timeout)
                .dry_run(dry_run);

            if dry_run {
                info!("Dry run mode - nothing will be written.");
            }
            let report = match count {
                Some(count) => runner.up_steps(count).await?,
                None => runner.up().await?,
            };
            print!("{}", report);
        }

        Commands::Down { steps } => {
            let migrations = load_migrations(&cli.migrations_dir)?;
            let runner = MigrationRunner::new(backend, migrations)?.with_lock_timeout(lock_timeout);
            let report = runner.down(steps).await?;
            print!("{}", report);
        }

        Commands::Status => {
            let migrations = load_migrations(&cli.migrations_dir)?;
            let runner = MigrationRunner::new(backend, migrations)?;
            let status = runner.status().await?;

            if status.is_empty() {
                info!("No migrations found.");
            } else {
                println!("\nMigrations:");
                println!("{:-<60}", "");
                for entry in &status {
                    let mark = match entry.state {
                        MigrationState::Applied => "X",
                        _ => " ",
                    };
                    let applied = entry
                        .applied_at
                        .map(|at| format!(" ({})", at.format("%Y-%m-%d %H:%M:%S")))
                        .unwrap_or_default();
                    let missing = if entry.registered { "" } else { " [not registered]" };
                    println!(" [{}] {}{}{}", mark, entry.id, applied, missing);
                }
                println!();
            }
        }

        Commands::Import {
            file,
            delete_missing,
            match_field_ids,
            dry_run,
        } => {
            let text = std::fs::read_to_string(&file)?;
            let desired = document::parse_snapshot(&file, &text)?;
            let importer = Importer::with_options(
                ImportOptions::new()
                    .delete_missing(delete_missing)
                    .match_field_ids(match_field_ids),
            );

            let runner = MigrationRunner::new(backend, Vec::new())?
                .with_lock_timeout(lock_timeout)
                .dry_run(dry_run);
            let changes = runner.import(&desired, &importer).await?;
            if dry_run {
                info!("Dry run mode - changes were not applied.");
            }
            print!("{}", changes);
        }

        Commands::Collections => {
            let collections = backend.collections().await?;
            println!("{}", serde_json::to_string_pretty(&collections)?);
        }
    }

    Ok(())
}
