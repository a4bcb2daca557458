use std::sync::Arc;

use clap::{Parser, Subcommand};

use polypulse::api::server::{self, AppState};
use polypulse::api::ws::ConnectionManager;
use polypulse::config::Config;
use polypulse::core::db::store::{self, Store};
use polypulse::core::discovery::Discovery;
use polypulse::core::indexer::{IndexOptions, Indexer};
use polypulse::core::rpc::RpcClient;
use polypulse::core::whales::WhaleDetector;
use polypulse::scheduler::SyncScheduler;

/// Blocks to rewind from the chain head on a first sync.
const DEFAULT_BLOCK_LOOKBACK: u64 = 100;

#[derive(Parser)]
#[command(name = "polypulse", version, about = "Polymarket sentiment-and-flow dashboard backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index on-chain OrderFilled trades and detect whales
    Index {
        /// Starting block (default: resume from the sync cursor, else head - 100)
        #[arg(long)]
        from_block: Option<u64>,
        /// Final block (default: chain head)
        #[arg(long)]
        to_block: Option<u64>,
        /// Database file path
        #[arg(long)]
        db: Option<String>,
        /// Blocks per eth_getLogs batch
        #[arg(long, default_value_t = 500)]
        batch_size: u64,
        /// Recreate the database before indexing
        #[arg(long)]
        reset: bool,
        /// Only persist fills from this transaction
        #[arg(long)]
        tx_hash: Option<String>,
    },
    /// Discover market metadata from the Gamma API
    Discover {
        /// Discover the markets under one event slug
        #[arg(long)]
        event_slug: Option<String>,
        /// Fetch every page of /markets
        #[arg(long = "all")]
        fetch_all: bool,
        /// Cap on the number of markets to pull
        #[arg(long)]
        limit: Option<usize>,
        /// Include closed markets in the sweep
        #[arg(long)]
        include_closed: bool,
        /// Also run the event-category repair pass
        #[arg(long)]
        update_categories: bool,
        /// Database file path
        #[arg(long)]
        db: Option<String>,
    },
    /// Run the API server (with background sync and WebSocket push)
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Database file path
        #[arg(long)]
        db: Option<String>,
        /// Background sync interval in seconds
        #[arg(long, default_value_t = 10)]
        sync_interval: u64,
        /// Disable the background sync scheduler
        #[arg(long)]
        no_scheduler: bool,
        /// Whale trade threshold in USD
        #[arg(long)]
        whale_threshold: Option<f64>,
    },
    /// Print database statistics
    Stats {
        /// Database file path
        #[arg(long)]
        db: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Index {
            from_block,
            to_block,
            db,
            batch_size,
            reset,
            tx_hash,
        } => cmd_index(from_block, to_block, db, batch_size, reset, tx_hash).await,
        Commands::Discover {
            event_slug,
            fetch_all,
            limit,
            include_closed,
            update_categories,
            db,
        } => cmd_discover(event_slug, fetch_all, limit, !include_closed, update_categories, db).await,
        Commands::Serve {
            host,
            port,
            db,
            sync_interval,
            no_scheduler,
            whale_threshold,
        } => cmd_serve(host, port, db, sync_interval, no_scheduler, whale_threshold).await,
        Commands::Stats { db } => cmd_stats(db).await,
    }
}

fn config_with_db(db: Option<String>) -> Config {
    let mut cfg = Config::from_env();
    if let Some(db) = db {
        cfg.database_path = db;
    }
    cfg
}

async fn cmd_index(
    from_block: Option<u64>,
    to_block: Option<u64>,
    db: Option<String>,
    batch_size: u64,
    reset: bool,
    tx_hash: Option<String>,
) -> anyhow::Result<()> {
    let cfg = config_with_db(db);
    let store = if reset {
        println!("Resetting database: {}", cfg.database_path);
        Store::reset(&cfg.database_path)?
    } else {
        println!("Initializing database: {}", cfg.database_path);
        Store::open(&cfg.database_path)?
    };
    let cfg = Arc::new(cfg);

    let http = reqwest::Client::new();
    let rpc = RpcClient::new(http.clone(), cfg.rpc_url.clone());
    let latest_block = rpc.block_number().await?;

    let to_block = to_block.unwrap_or(latest_block);
    let from_block = match from_block {
        Some(block) => block,
        None if reset => latest_block.saturating_sub(DEFAULT_BLOCK_LOOKBACK).max(1),
        None => match store.with(|conn| store::get_sync_state(conn, store::TRADE_SYNC_KEY))? {
            Some(last) => {
                let resume = last as u64 + 1;
                println!("Resuming from sync state: block {resume}");
                resume
            }
            None => {
                let first = latest_block.saturating_sub(DEFAULT_BLOCK_LOOKBACK).max(1);
                println!("First sync, starting from block: {first} (latest - {DEFAULT_BLOCK_LOOKBACK})");
                first
            }
        },
    };

    if from_block > to_block {
        println!("Already synced up to {}. Target {to_block} is behind.", from_block - 1);
        return Ok(());
    }

    let discovery = Discovery::new(http.clone(), cfg.clone(), store.clone());
    let indexer = Indexer::new(rpc, store.clone(), discovery, cfg.clone());

    println!("Indexing trades from block {from_block} to {to_block}...");
    let report = indexer
        .run(from_block, to_block, IndexOptions { batch_size, tx_hash })
        .await?;

    println!("\nIndexing complete:");
    println!("  - Total logs scanned: {}", report.total_logs);
    println!("  - Trades inserted: {}", report.inserted_trades);
    println!("  - Markets discovered: {}", report.discovered_markets);
    if report.unknown_tokens > 0 {
        println!("  - Unknown tokens skipped: {}", report.unknown_tokens);
    }
    for warning in report.warnings.iter().take(5) {
        println!("  - Warning: {warning}");
    }

    println!("\nDetecting whale trades...");
    let whale_count = WhaleDetector::new(store, cfg.whale_threshold)
        .backfill()
        .await?;
    println!("  - Whale trades detected: {whale_count}");

    println!("\nDone!");
    Ok(())
}

async fn cmd_discover(
    event_slug: Option<String>,
    fetch_all: bool,
    limit: Option<usize>,
    active_only: bool,
    update_categories: bool,
    db: Option<String>,
) -> anyhow::Result<()> {
    let cfg = config_with_db(db);
    let store = Store::open(&cfg.database_path)?;
    let cfg = Arc::new(cfg);
    let discovery = Discovery::new(reqwest::Client::new(), cfg, store);

    let report = match &event_slug {
        Some(slug) => {
            println!("Discovering markets for event: {slug}");
            discovery.discover_by_event_slug(slug).await?
        }
        None => {
            println!("Discovering all markets (active_only={active_only}, fetch_all={fetch_all})");
            discovery.discover_all(active_only, limit, fetch_all).await?
        }
    };

    println!("\nDiscovery complete:");
    println!("  - Markets found: {}", report.markets_found);
    println!("  - Markets saved/updated: {}", report.markets_saved);
    if !report.warnings.is_empty() {
        println!("\nWarnings ({}):", report.warnings.len());
        for warning in report.warnings.iter().take(5) {
            println!("  - {warning}");
        }
    }

    if update_categories {
        println!("\nUpdating categories from events...");
        let updated = discovery.update_categories_from_events().await?;
        println!("  - Markets updated: {updated}");
    }

    println!("\nDone!");
    Ok(())
}

async fn cmd_serve(
    host: Option<String>,
    port: Option<u16>,
    db: Option<String>,
    sync_interval: u64,
    no_scheduler: bool,
    whale_threshold: Option<f64>,
) -> anyhow::Result<()> {
    let mut cfg = config_with_db(db);
    if let Some(host) = host {
        cfg.api_host = host;
    }
    if let Some(port) = port {
        cfg.api_port = port;
    }
    if let Some(threshold) = whale_threshold {
        cfg.whale_threshold = threshold;
    }
    cfg.sync_interval_secs = sync_interval;
    if no_scheduler {
        cfg.enable_scheduler = false;
    }

    let store = Store::open(&cfg.database_path)?;
    let cfg = Arc::new(cfg);
    let http = reqwest::Client::new();
    let ws_manager = Arc::new(ConnectionManager::new());

    let scheduler = if cfg.enable_scheduler {
        let rpc = RpcClient::new(http.clone(), cfg.rpc_url.clone());
        let discovery = Discovery::new(http.clone(), cfg.clone(), store.clone());
        let indexer = Indexer::new(rpc, store.clone(), discovery, cfg.clone());
        let scheduler = Arc::new(SyncScheduler::new(
            store.clone(),
            indexer,
            http.clone(),
            cfg.clone(),
            ws_manager.clone(),
        ));
        scheduler.start();
        Some(scheduler)
    } else {
        tracing::info!("Background scheduler disabled");
        None
    };

    tracing::info!("Using database: {}", cfg.database_path);
    tracing::info!(
        "WebSocket endpoints: ws://{}:{}/api/ws/whales, ws://{}:{}/api/ws/trades",
        cfg.api_host,
        cfg.api_port,
        cfg.api_host,
        cfg.api_port
    );

    let state = AppState::new(store, http, cfg.clone(), ws_manager, scheduler);
    server::run(state, &cfg.api_host, cfg.api_port).await?;
    Ok(())
}

async fn cmd_stats(db: Option<String>) -> anyhow::Result<()> {
    let cfg = config_with_db(db);
    let store = Store::open(&cfg.database_path)?;

    println!("Database: {}\n", cfg.database_path);
    println!("Table Statistics:");
    println!("{}", "-".repeat(40));
    store.with(|conn| {
        for table in ["events", "markets", "trades", "whale_trades"] {
            match store::table_count(conn, table) {
                Ok(count) => println!("  {table}: {count} records"),
                Err(_) => println!("  {table}: (table not found)"),
            }
        }
        Ok(())
    })?;

    println!("\nSync State:");
    println!("{}", "-".repeat(40));
    store.with(|conn| {
        let mut stmt = conn.prepare("SELECT key, last_block, updated_at FROM sync_state")?;
        let rows: Vec<(String, Option<i64>, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?;
        if rows.is_empty() {
            println!("  (no sync state)");
        }
        for (key, block, updated_at) in rows {
            println!(
                "  {key}: block {} ({})",
                block.unwrap_or(0),
                updated_at.unwrap_or_default()
            );
        }
        Ok(())
    })?;

    Ok(())
}
