//! # Quakedex CLI (`qdx`)
//!
//! The `qdx` binary drives the indexing engine from the command line. It
//! provides commands for database initialization, product ingestion,
//! event search, and manual archive sweeps.
//!
//! ## Usage
//!
//! ```bash
//! qdx --config ./config/qdx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qdx init` | Create the SQLite database and run schema migrations |
//! | `qdx ingest <file>...` | Index product JSON files and print the changes |
//! | `qdx search` | List event summaries matching filters |
//! | `qdx sweep` | Run every configured archive policy once |
//! | `qdx run` | Run the periodic archive sweeper until interrupted |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use quakedex::archive::ArchiveSweeper;
use quakedex::config;
use quakedex::db;
use quakedex::error::IndexerError;
use quakedex::index::ProductIndex;
use quakedex::indexer::Indexer;
use quakedex::migrate;
use quakedex::models::Product;
use quakedex::query::{ProductIndexQuery, SearchQuery, SearchRequest, SearchResult};
use quakedex::storage::FileProductStorage;

/// Quakedex CLI — an event association and product indexing engine for
/// seismic data feeds.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/qdx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "qdx",
    about = "Quakedex — an event association and product indexing engine for seismic data feeds",
    version,
    long_about = "Quakedex ingests versioned products from independent reporting networks, \
    clusters them into logical events with deterministic preferred-record selection, and \
    notifies listeners of every change."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qdx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the events and products
    /// tables. This command is idempotent — running it multiple times
    /// is safe.
    Init,

    /// Ingest product JSON files.
    ///
    /// Each file holds one product record. Files are indexed in order
    /// and the resulting change list is printed per product.
    Ingest {
        /// Product JSON files to index.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List event summaries matching the given filters.
    Search {
        /// Event source network (e.g. `us`, `ak`).
        #[arg(long)]
        source: Option<String>,

        /// Event code assigned by the source network.
        #[arg(long)]
        code: Option<String>,

        /// Minimum event magnitude.
        #[arg(long)]
        min_magnitude: Option<f64>,

        /// Maximum event magnitude.
        #[arg(long)]
        max_magnitude: Option<f64>,
    },

    /// Run every configured archive policy once.
    Sweep,

    /// Run the periodic archive sweeper until interrupted.
    ///
    /// Sweeps once at startup and again on every `archive.interval_secs`
    /// tick. Exits cleanly on Ctrl-C.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { files } => {
            let indexer = build_indexer(&cfg).await?;
            for file in files {
                let json = std::fs::read_to_string(&file)?;
                let product: Product = serde_json::from_str(&json)?;
                match indexer.on_product(&product).await {
                    Ok(result) => {
                        println!("{}:", product.id);
                        for change in &result.changes {
                            println!("  {}", change.kind);
                        }
                    }
                    Err(e)
                        if matches!(
                            e.downcast_ref::<IndexerError>(),
                            Some(IndexerError::AlreadyInStorage(_))
                        ) =>
                    {
                        println!("{}: already indexed, skipping", product.id);
                    }
                    Err(e) => return Err(e),
                }
            }
            indexer.shutdown().await;
        }
        Commands::Search {
            source,
            code,
            min_magnitude,
            max_magnitude,
        } => {
            let indexer = build_indexer(&cfg).await?;
            let mut query = ProductIndexQuery::new();
            query.event_source = source;
            query.event_source_code = code;
            query.min_event_magnitude = min_magnitude;
            query.max_event_magnitude = max_magnitude;
            let response = indexer
                .search(&SearchRequest {
                    queries: vec![SearchQuery::EventsSummary(query)],
                })
                .await?;
            for result in response.results {
                let SearchResult::EventsSummary(summaries) = result else {
                    continue;
                };
                if summaries.is_empty() {
                    println!("No results.");
                    continue;
                }
                for summary in summaries {
                    println!(
                        "{} time={} lat={} lon={} mag={}{}",
                        summary.event_id().unwrap_or_else(|| "(no id)".to_string()),
                        summary
                            .time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string()),
                        summary.latitude.map_or("-".to_string(), |v| v.to_string()),
                        summary.longitude.map_or("-".to_string(), |v| v.to_string()),
                        summary.magnitude.map_or("-".to_string(), |v| v.to_string()),
                        if summary.deleted { " (deleted)" } else { "" },
                    );
                }
            }
            indexer.shutdown().await;
        }
        Commands::Sweep => {
            let indexer = build_indexer(&cfg).await?;
            let removed = indexer.sweep_archives().await?;
            println!("Archive sweep removed {} rows.", removed);
            indexer.shutdown().await;
        }
        Commands::Run => {
            if cfg.archive.disabled {
                anyhow::bail!("archive sweeping is disabled in the configuration");
            }
            let indexer = Arc::new(build_indexer(&cfg).await?);
            let sweeper = ArchiveSweeper::spawn(Arc::clone(&indexer), cfg.archive.interval_secs);
            println!(
                "Sweeping archives every {}s. Press Ctrl-C to stop.",
                cfg.archive.interval_secs
            );
            tokio::signal::ctrl_c().await?;
            sweeper.shutdown().await;
            indexer.shutdown().await;
        }
    }

    Ok(())
}

async fn build_indexer(cfg: &config::Config) -> Result<Indexer> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    let index = ProductIndex::new(pool);
    let storage = Arc::new(FileProductStorage::new(&cfg.storage.directory));
    Ok(Indexer::new(index, storage, cfg, Vec::new()))
}
