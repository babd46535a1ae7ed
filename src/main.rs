//! logtally - incremental W3C access-log statistics
//!
//! Reads IIS-style W3C extended logs into SQLite and derives:
//! - Hourly activity, per-page and per-visitor traffic
//! - Referrer, user-agent and error breakdowns
//! - A JSON summary of the results

mod aggregate;
mod config;
mod db;
mod error;
mod ingest;
mod parser;
mod summary;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::aggregate::Aggregator;
use crate::config::{split_list, Config, Overrides};
use crate::db::{Database, HostFilter};
use crate::ingest::Ingestor;

#[derive(Parser, Debug)]
#[command(
    name = "logtally",
    version,
    about = "Ingest W3C access logs and build usage statistics"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Comma-delimited list of directories to scan for log files
    #[arg(short = 'l', long = "logs", global = true)]
    log_folders: Option<String>,

    /// Comma-delimited list of file extensions to read (default: .log)
    #[arg(short, long, global = true)]
    extensions: Option<String>,

    /// Comma-delimited list of server or client addresses to restrict statistics to
    #[arg(short, long, global = true)]
    filter: Option<String>,

    /// Re-read files that were already ingested
    #[arg(long, global = true)]
    force: bool,

    /// Delete all stored records and statistics before ingesting
    #[arg(long, global = true)]
    rebuild: bool,

    /// Path to the config file
    #[arg(long, default_value = "logtally.toml", global = true)]
    config: String,

    /// Verbose logging, including the resolved database location
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Ingest, rebuild statistics and print the summary (default)
    Run,
    /// Only ingest new log files
    Ingest,
    /// Only rebuild the statistic tables
    Aggregate,
    /// Print the summary of the current statistics
    Summary,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            directories: self.log_folders.as_deref().map(split_list),
            extensions: self.extensions.as_deref().map(split_list),
            domain_filters: self.filter.as_deref().map(split_list),
            force_reload: self.force,
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load(&cli.config, &cli.overrides())?;
    init_logging(&config.logging.level);

    info!("Starting logtally...");
    if cli.debug {
        info!(database = %config.database.url, ?config, "Configuration loaded");
    }

    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let filter = HostFilter::new(config.aggregate.domain_filters.clone());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            run_ingest(&db, &config, cli.rebuild).await?;
            run_aggregate(&db, &config, &filter).await?;
            print_json(&summary::build(&db, &filter).await?)?;
        }
        Command::Ingest => {
            let report = run_ingest(&db, &config, cli.rebuild).await?;
            print_json(&report)?;
        }
        Command::Aggregate => {
            let report = run_aggregate(&db, &config, &filter).await?;
            print_json(&report)?;
        }
        Command::Summary => {
            print_json(&summary::build(&db, &filter).await?)?;
        }
    }

    Ok(())
}

/// Initialize logging based on LOG_FORMAT env var.
/// Use LOG_FORMAT=gcp for structured GCP Cloud Logging.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        // stdout carries the JSON output
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_ingest(db: &Database, config: &Config, rebuild: bool) -> Result<ingest::IngestReport> {
    if config.ingest.directories.is_empty() {
        anyhow::bail!("No log folders specified. Pass --logs or set ingest.directories");
    }

    let ingestor = Ingestor::new(db, config.ingest.batch_size);
    if rebuild {
        info!("Rebuilding database...");
        ingestor.clear_all().await?;
    }

    let directories: Vec<PathBuf> = config.ingest.directories.iter().map(PathBuf::from).collect();
    let report = ingestor
        .ingest(&directories, &config.ingest.extensions, config.ingest.force_reload)
        .await?;

    info!(total = db.get_total_count().await?, "Records stored");
    if !report.failures.is_empty() {
        warn!(
            failed = report.failures.len(),
            "Some inputs could not be read; they will be retried on the next run"
        );
    }
    Ok(report)
}

async fn run_aggregate(
    db: &Database,
    config: &Config,
    filter: &HostFilter,
) -> Result<aggregate::AggregateReport> {
    let report = Aggregator::new(db, config.aggregate.batch_size)
        .with_progress(|table, processed, total| {
            info!(%table, processed, total, "Statistics progress");
        })
        .aggregate(filter)
        .await?;
    Ok(report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
