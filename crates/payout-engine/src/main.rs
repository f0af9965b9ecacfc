//! Payout tracker CLI
//!
//! Backfills monthly snapshots from the explorer, reconciles the warm cache
//! and prints period statistics.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use payout_engine::backfill::{self, Backfill};
use payout_engine::config::{self, Config, FileConfig};
use payout_engine::constants;
use payout_engine::explorer::{ExplorerClient, Pagination};
use payout_engine::month::YearMonth;
use payout_engine::normalize::Normalizer;
use payout_engine::period::{Period, SnapshotLoader};
use payout_engine::prices;
use payout_engine::report;
use payout_engine::store::SnapshotStore;
use payout_engine::warm::{Reconciler, WarmCache};

#[derive(Parser, Debug)]
#[command(name = "payout-engine")]
#[command(about = "Verified payout tracking: snapshot backfill, warm-cache sync and period stats")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = constants::CONFIG_FILENAME, env = "PAYOUT_CONFIG", global = true)]
    config: PathBuf,

    /// Data directory (overrides storage.data_dir)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build missing monthly snapshots
    Backfill {
        /// Only these entities (repeatable)
        #[arg(long)]
        entity: Vec<String>,

        /// Only these months, YYYY-MM (repeatable; replaces the computed plan)
        #[arg(long)]
        month: Vec<YearMonth>,

        /// Print the plan without fetching or writing anything
        #[arg(long)]
        dry_run: bool,

        /// Replace existing snapshots for the given --month values
        #[arg(long)]
        rebuild: bool,
    },

    /// Reconcile the warm cache against the last 30 days
    Sync {
        /// Only these entities (repeatable)
        #[arg(long)]
        entity: Vec<String>,
    },

    /// Delete orphaned warm-cache rows older than the retention window
    Cleanup {
        /// Override sync.retention_days
        #[arg(long)]
        retention_days: Option<i64>,
    },

    /// Print a 7d, 30d or 12m aggregate
    Period {
        entity: String,
        period: Period,
    },

    /// Export an aggregate's transactions to CSV
    Export {
        entity: String,
        period: Period,

        /// Output file
        #[arg(long)]
        out: PathBuf,
    },

    /// Snapshot and warm-cache counts
    Stats,
}

/// Load config file or exit with helpful message
fn load_config(path: &Path, data_dir: Option<PathBuf>) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!(
            "Config file '{}' not found.\n\n\
            To get started:\n\
            1. Copy config.toml.example to config.toml\n\
            2. Fill in your explorer API key and entities\n\n\
            See config.toml.example for the required format.",
            path.display()
        );
    }

    let file_config = FileConfig::load(path)?;
    let mut config = Config::from_file(&file_config, std::env::var("EXPLORER_API_KEY").ok())?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args.config, args.data_dir)?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    match args.command {
        Command::Backfill {
            entity,
            month,
            dry_run,
            rebuild,
        } => run_backfill(&config, &entity, &month, dry_run, rebuild).await,
        Command::Sync { entity } => run_sync(&config, &entity).await,
        Command::Cleanup { retention_days } => run_cleanup(&config, retention_days).await,
        Command::Period { entity, period } => {
            let aggregate = load_aggregate(&config, &entity, period).await?;
            report::print_period(&aggregate);
            Ok(())
        }
        Command::Export { entity, period, out } => {
            let aggregate = load_aggregate(&config, &entity, period).await?;
            report::export_transactions(&out, &aggregate)?;
            println!("Wrote {} transactions to {}", aggregate.transactions.len(), out.display());
            Ok(())
        }
        Command::Stats => {
            let store = SnapshotStore::new(config.snapshot_dir());
            let warm = WarmCache::open(&config.warm_cache_path()).await?;
            report::print_stats(&store.stats()?, warm.list().await?.len());
            Ok(())
        }
    }
}

async fn normalizer(config: &Config) -> Normalizer {
    let price = prices::native_usd_price(config.native_usd_price, config.live_native_price).await;
    Normalizer::new(price, config.explorer.clock)
}

async fn run_backfill(
    config: &Config,
    entity_filter: &[String],
    months: &[YearMonth],
    dry_run: bool,
    rebuild: bool,
) -> Result<()> {
    let entities = config.select_entities(entity_filter)?;
    let store = SnapshotStore::new(config.snapshot_dir());
    let jobs = backfill::plan(&store, &entities, config.epoch_start, Utc::now(), months, rebuild)?;

    if dry_run {
        println!("\nBackfill plan ({} months):", jobs.len());
        for job in &jobs {
            let action = if job.rebuild { "rebuild" } else { "build" };
            println!("  {:<24} {}  {}", job.entity.id, job.month, action);
        }
        return Ok(());
    }

    if jobs.is_empty() {
        println!("Nothing to backfill.");
        return Ok(());
    }

    let client = ExplorerClient::new(&config.explorer)?;
    let runner = Backfill {
        source: &client,
        store: &store,
        normalizer: normalizer(config).await,
        pagination: Pagination::from_settings(&config.explorer),
        concurrency: config.backfill_concurrency,
    };

    info!(months = jobs.len(), concurrency = config.backfill_concurrency, "Starting backfill");
    let report = runner.run(jobs).await;

    println!("\nBackfill complete:");
    println!("  Planned:          {}", report.planned);
    println!("  Written:          {}", report.written);
    println!("  Replaced:         {}", report.replaced);
    println!("  Already present:  {}", report.skipped_existing);
    println!("  Empty:            {}", report.empty);
    println!("  Failed:           {}", report.failed.len());
    for (entity, month, error) in &report.failed {
        println!("    {} {}: {}", entity, month, error);
    }
    Ok(())
}

async fn run_sync(config: &Config, entity_filter: &[String]) -> Result<()> {
    let entities = config.select_entities(entity_filter)?;
    let loader = SnapshotLoader::new(SnapshotStore::new(config.snapshot_dir()), config.month_cache_ttl);
    let warm = WarmCache::open(&config.warm_cache_path()).await?;
    let client = ExplorerClient::new(&config.explorer)?;

    let reconciler = Reconciler {
        source: &client,
        loader: &loader,
        warm: &warm,
        normalizer: normalizer(config).await,
        pagination: Pagination::from_settings(&config.explorer),
    };
    let report = reconciler.batch_sync(&entities, config.entity_delay).await;

    println!("\nWarm sync: {} ok, {} failed", report.synced(), report.failed.len());
    for result in &report.results {
        print!("  {:<24}", result.entity_id);
        report::print_warm_row(&result.row);
    }
    Ok(())
}

async fn run_cleanup(config: &Config, retention_days: Option<i64>) -> Result<()> {
    let warm = WarmCache::open(&config.warm_cache_path()).await?;
    let retention = match retention_days {
        Some(days) => config::retention_window(days)?,
        None => config.retention,
    };
    let known: Vec<String> = config.entities.iter().map(|e| e.id.clone()).collect();

    let removed = warm.cleanup(&known, retention, Utc::now()).await?;
    println!("Removed {} orphaned warm-cache rows", removed);
    Ok(())
}

async fn load_aggregate(config: &Config, entity_id: &str, period: Period) -> Result<payout_engine::PeriodAggregate> {
    let entity = config
        .entity(entity_id)
        .with_context(|| format!("Unknown entity '{}'", entity_id))?;
    let loader = SnapshotLoader::new(SnapshotStore::new(config.snapshot_dir()), config.month_cache_ttl);
    let warm = WarmCache::open(&config.warm_cache_path()).await?;

    Ok(loader
        .load_period(entity, period, Utc::now())
        .with_warm(warm.get(&entity.id).await?))
}
