use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vpic_sync::{
    catalog_source, load_file, open_store, run_sync_once, DdlBootstrapper, HarvestConfig,
    HarvestPipeline, LedgerSource, MemoryStore, PgStore, TargetStore,
};

#[derive(Debug, Parser)]
#[command(name = "vpic-cli")]
#[command(about = "Incremental vPIC makes/models harvester")]
struct Cli {
    /// YAML overlay for the environment configuration (default: $VPIC_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load makes, then models for makes that have none yet.
    Sync {
        /// Maximum makes to fetch models for; 0 lifts the cap.
        #[arg(long)]
        limit: Option<usize>,
        /// Load into an in-memory store instead of PostgreSQL.
        #[arg(long)]
        dry_run: bool,
        /// Serve upstream listings from recorded JSON files.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Create the target tables if missing.
    Migrate {
        /// Print the DDL instead of applying it.
        #[arg(long)]
        print: bool,
    },
    /// Upsert a CSV file into a table.
    Load {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        table: String,
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long)]
        staging: Option<String>,
    },
    /// Show the makes whose models are still missing.
    Delta {
        #[arg(long)]
        limit: Option<usize>,
        /// Read makes from the saved makes file instead of the API.
        #[arg(long)]
        from_file: bool,
    },
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);
    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "etl.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .context("installing tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()
                .context("installing tracing subscriber")?;
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = HarvestConfig::load(cli.config.as_deref())?;
    let _log_guard = init_logging(config.log_dir.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync {
        limit: None,
        dry_run: false,
        fixtures: None,
    }) {
        Commands::Sync {
            limit,
            dry_run,
            fixtures,
        } => {
            if let Some(limit) = limit {
                config.models_limit = (limit > 0).then_some(limit);
            }
            let summary = run_sync_once(config, dry_run, fixtures.as_deref()).await?;
            println!(
                "sync complete: run_id={} makes={} remaining={} failed={} models={} inserted={} updated={}",
                summary.run_id,
                summary.makes,
                summary.remaining_keys.len(),
                summary.failed_units,
                summary.models,
                summary.models_merge.inserted,
                summary.models_merge.updated
            );
        }
        Commands::Migrate { print } => {
            let ddl = DdlBootstrapper::for_catalog();
            if print {
                print!("{}", ddl.render_sql());
            } else {
                let store = PgStore::connect(&config.database.connection_url())
                    .await
                    .with_context(|| format!("connecting to {}", config.database.redacted()))?;
                ddl.ensure_schema(&store).await?;
                info!(database = %config.database.redacted(), "migrations applied");
            }
        }
        Commands::Load {
            file,
            table,
            keys,
            staging,
        } => {
            let store = open_store(&config, false).await?;
            let result = load_file(store, &file, &table, &keys, staging.as_deref()).await?;
            println!(
                "load complete: table={table} inserted={} updated={}",
                result.inserted, result.updated
            );
        }
        Commands::Delta { limit, from_file } => {
            let store: Arc<dyn TargetStore> = match config.ledger {
                LedgerSource::Store => open_store(&config, false).await?,
                LedgerSource::File => Arc::new(MemoryStore::new()),
            };
            let limit = limit.map(|l| (l > 0).then_some(l)).unwrap_or(config.models_limit);
            let source = catalog_source(&config, None)?;
            let remaining = HarvestPipeline::new(config, source, store)
                .plan(from_file, limit)
                .await?;
            println!("{}", serde_json::to_string(&remaining)?);
        }
    }

    Ok(())
}
