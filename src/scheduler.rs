//! Periodic sync pipeline.
//!
//! Each tick runs: incremental trade indexing → market metadata refresh →
//! unique-trader rollup → whale tail + fan-out. The `is_syncing` flag makes
//! ticks non-overlapping: a tick that arrives mid-sync is skipped outright.
//! On shutdown the in-flight sync finishes; only new ticks are suppressed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, RwLock, Semaphore};

use crate::config::Config;
use crate::core::db::store::{self, Store};
use crate::core::discovery::{self, GammaMarket};
use crate::core::indexer::Indexer;
use crate::core::metrics::cutoff_iso;
use crate::core::whales::WhaleDetector;
use crate::api::ws::ConnectionManager;
use crate::error::Result;

const REFRESH_MARKET_LIMIT: usize = 50;
const REFRESH_CONCURRENCY: usize = 10;
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
const SYNC_BATCH_SIZE: u64 = 500;

#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncSummary {
    pub sync_count: u64,
    pub inserted_trades: usize,
    pub discovered_markets: usize,
    pub new_whales: usize,
    pub refreshed_markets: usize,
    pub from_block: u64,
    pub to_block: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SyncScheduler {
    store: Store,
    indexer: Indexer,
    http: reqwest::Client,
    cfg: Arc<Config>,
    ws: Arc<ConnectionManager>,
    interval: Duration,
    whale_threshold: f64,
    running: AtomicBool,
    is_syncing: AtomicBool,
    sync_count: AtomicU64,
    last_result: RwLock<Option<SyncSummary>>,
    shutdown: Notify,
}

/// Resets the syncing flag even if the pipeline unwinds.
struct SyncFlagGuard<'a>(&'a AtomicBool);

impl Drop for SyncFlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncScheduler {
    pub fn new(
        store: Store,
        indexer: Indexer,
        http: reqwest::Client,
        cfg: Arc<Config>,
        ws: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(cfg.sync_interval_secs.max(1)),
            whale_threshold: cfg.whale_threshold,
            store,
            indexer,
            http,
            cfg,
            ws,
            running: AtomicBool::new(false),
            is_syncing: AtomicBool::new(false),
            sync_count: AtomicU64::new(0),
            last_result: RwLock::new(None),
            shutdown: Notify::new(),
        }
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Scheduler started: syncing every {}s, whale threshold ${}",
            self.interval.as_secs(),
            self.whale_threshold
        );
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; skip it so startup
            // isn't a surprise sync.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scheduler.shutdown.notified() => break,
                }
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
                scheduler.sync_job().await;
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            tracing::info!("Scheduler loop exited");
        })
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
            tracing::info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One tick. Skips (and logs) when a sync is already in flight — the
    /// non-overlap contract.
    pub async fn sync_job(&self) {
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            tracing::warn!("Previous sync still running, skipping...");
            return;
        }
        let _guard = SyncFlagGuard(&self.is_syncing);
        let count = self.sync_count.fetch_add(1, Ordering::SeqCst) + 1;

        let summary = match self.run_pipeline(count).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("[Sync #{count}] Sync job failed: {e}");
                SyncSummary {
                    sync_count: count,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        *self.last_result.write().await = Some(summary);
    }

    async fn run_pipeline(&self, count: u64) -> Result<SyncSummary> {
        tracing::info!("[Sync #{count}] Starting sync...");

        // (a) Incremental indexing from the trade_sync cursor.
        let report = self.indexer.sync_trades(None, SYNC_BATCH_SIZE).await?;
        let inserted = report.inserted_trades;
        tracing::info!("[Sync #{count}] Synced {inserted} new trades");

        for trade in &report.new_trades {
            self.ws.broadcast_trade(trade).await;
        }

        // (b) Refresh prices/status for the most active markets.
        let refreshed = match self.refresh_market_metadata().await {
            Ok(n) => {
                if n > 0 {
                    tracing::info!("[Sync #{count}] Refreshed {n} markets (prices & status)");
                }
                n
            }
            Err(e) => {
                tracing::warn!("[Sync #{count}] Market refresh failed: {e}");
                0
            }
        };

        // (c) Sliding 24 h unique-trader rollup for the busiest markets.
        let cutoff = cutoff_iso(86400);
        let traders_updated = self
            .store
            .call(move |conn| store::update_unique_traders(conn, REFRESH_MARKET_LIMIT, &cutoff))
            .await?;
        if traders_updated > 0 {
            tracing::info!("[Sync #{count}] Updated unique_traders for {traders_updated} markets");
        }

        // (d) Whale tail + fan-out, only when something new landed.
        let mut new_whales = 0;
        if inserted > 0 {
            let detector = WhaleDetector::new(self.store.clone(), self.whale_threshold);
            let whales = detector.detect_new().await?;
            new_whales = whales.len();
            if new_whales > 0 {
                tracing::info!("[Sync #{count}] Detected {new_whales} new whale trades");
                for whale in &whales {
                    self.ws.broadcast_whale_alert(whale).await;
                }
            }
        }

        Ok(SyncSummary {
            sync_count: count,
            inserted_trades: inserted,
            discovered_markets: report.discovered_markets,
            new_whales,
            refreshed_markets: refreshed,
            from_block: report.from_block,
            to_block: report.to_block,
            error: None,
        })
    }

    /// Pulls fresh `outcomePrices`/status (and the parent event slug) for the
    /// top markets by volume, at most ten Gamma requests in flight.
    async fn refresh_market_metadata(&self) -> Result<usize> {
        let markets = self
            .store
            .call(|conn| store::markets_for_refresh(conn, REFRESH_MARKET_LIMIT))
            .await?;
        if markets.is_empty() {
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(REFRESH_CONCURRENCY));
        let mut handles = Vec::with_capacity(markets.len());
        for (market_id, slug, event_id) in markets {
            let http = self.http.clone();
            let base = self.cfg.gamma_api_base.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let resp = http
                    .get(format!("{base}/markets"))
                    .query(&[("slug", slug.as_str())])
                    .timeout(REFRESH_TIMEOUT)
                    .send()
                    .await
                    .ok()?;
                let payload: Vec<GammaMarket> = resp.json().await.ok()?;
                let market = payload.into_iter().next()?;
                let event_slug = market.events.first().and_then(|e| e.slug.clone());
                Some((
                    market_id,
                    discovery::stringified_prices(&market),
                    discovery::market_status(&market),
                    event_id,
                    event_slug,
                ))
            }));
        }

        let mut updates = Vec::new();
        for handle in handles {
            if let Ok(Some(update)) = handle.await {
                updates.push(update);
            }
        }

        let updated = self
            .store
            .call(move |conn| {
                let mut count = 0;
                for (market_id, prices, status, event_id, event_slug) in &updates {
                    store::apply_market_refresh(conn, *market_id, prices.as_deref(), status)?;
                    count += 1;
                    if let (Some(event_id), Some(event_slug)) = (event_id, event_slug) {
                        store::update_event_slug(conn, *event_id, event_slug)?;
                    }
                }
                Ok(count)
            })
            .await?;
        Ok(updated)
    }

    /// Manual trigger, used by `POST /api/scheduler/trigger`.
    pub async fn trigger_sync(&self) -> Option<SyncSummary> {
        self.sync_job().await;
        self.last_result.read().await.clone()
    }

    pub async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "running": self.running.load(Ordering::SeqCst),
            "is_syncing": self.is_syncing.load(Ordering::SeqCst),
            "interval_seconds": self.interval.as_secs(),
            "sync_count": self.sync_count.load(Ordering::SeqCst),
            "last_result": self.last_result.read().await.clone(),
            "whale_threshold": self.whale_threshold,
        })
    }
}
