use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wsnap_storage::{PgSnapshotStore, SnapshotStore};
use wsnap_sync::{SyncConfig, SyncOptions};

#[derive(Debug, Parser)]
#[command(name = "wsnap-cli")]
#[command(about = "Daily stock-screen snapshot loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Query the screen and replace today's partition.
    Sync {
        /// Read the query result from a saved JSON file.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Ingest into memory only.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check the store and list the most recent partitions.
    Status,
    /// Create the table when writing directly to Postgres.
    Migrate,
    /// Print one partition as JSON lines.
    Show {
        #[arg(long)]
        date: NaiveDate,
    },
}

const STATUS_PARTITIONS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        fixture: None,
        dry_run: false,
    }) {
        Commands::Sync { fixture, dry_run } => {
            let outcome = wsnap_sync::run_sync(&config, SyncOptions { fixture, dry_run }).await?;
            println!(
                "sync {}: date={} count={} fetched={} skipped={}",
                if outcome.success { "complete" } else { "failed" },
                outcome.update_date,
                outcome.count,
                outcome.fetched_rows,
                outcome.skipped_rows
            );
            if let Some(warning) = &outcome.cleanup_warning {
                eprintln!("warning: partition cleanup failed: {warning}");
            }
            if let Some(error) = outcome.error {
                bail!("sync failed: {error}");
            }
        }
        Commands::Status => {
            let store = wsnap_sync::open_store(&config).await?;
            store
                .ping()
                .await
                .with_context(|| format!("store table {} is not reachable", store.table()))?;
            println!("table {} reachable", store.table());
            let counts = store.partition_counts().await?;
            for line in wsnap_sync::partition_status_lines(&counts, STATUS_PARTITIONS) {
                println!("{line}");
            }
        }
        Commands::Migrate => {
            let Some(database_url) = &config.database_url else {
                bail!("migrate needs DATABASE_URL; REST-backed tables are managed on the server");
            };
            let store = PgSnapshotStore::connect(database_url, config.table.clone()).await?;
            store.migrate().await?;
            println!("table {} ready", config.table);
        }
        Commands::Show { date } => {
            let store = wsnap_sync::open_store(&config).await?;
            for record in store.select_partition(date).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }

    Ok(())
}
