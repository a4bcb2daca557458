use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use super::{categories, insights, klines, levels, markets, metrics, system, traders, whales, ws};
use crate::config::Config;
use crate::core::db::store::Store;
use crate::error::Result;
use crate::scheduler::SyncScheduler;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub http: reqwest::Client,
    pub cfg: Arc<Config>,
    pub ws: Arc<ws::ConnectionManager>,
    pub scheduler: Option<Arc<SyncScheduler>>,
    pub levels: levels::LevelCache,
    pub event_categories: traders::EventCategoryCache,
}

impl AppState {
    pub fn new(
        store: Store,
        http: reqwest::Client,
        cfg: Arc<Config>,
        ws_manager: Arc<ws::ConnectionManager>,
        scheduler: Option<Arc<SyncScheduler>>,
    ) -> Self {
        Self {
            store,
            http,
            cfg,
            ws: ws_manager,
            scheduler,
            levels: levels::new_cache(),
            event_categories: traders::new_event_category_cache(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(system::root))
        .route("/health", get(system::health))
        .route("/api/stats", get(system::stats))
        .route("/api/scheduler/status", get(system::scheduler_status))
        .route("/api/scheduler/trigger", post(system::scheduler_trigger))
        .route("/api/markets", get(markets::list_markets))
        .route("/api/markets/{market_id}", get(markets::get_market))
        .route("/api/markets/{market_id}/price", get(markets::get_market_price))
        .route(
            "/api/markets/{market_id}/holders",
            get(markets::get_market_holders),
        )
        .route("/api/categories", get(categories::get_categories))
        .route("/api/klines", get(klines::get_klines))
        .route("/api/klines/price/{market_id}", get(klines::get_latest_price))
        .route("/api/klines/range/{market_id}", get(klines::get_price_range))
        .route("/api/metrics/{market_id}", get(metrics::get_market_metrics))
        .route(
            "/api/metrics/{market_id}/buy-sell-ratio",
            get(metrics::get_buy_sell_ratio),
        )
        .route("/api/metrics/{market_id}/vwap", get(metrics::get_vwap))
        .route(
            "/api/metrics/{market_id}/whale-signal",
            get(metrics::get_whale_signal),
        )
        .route(
            "/api/metrics/{market_id}/traders",
            get(metrics::get_trader_stats),
        )
        .route("/api/whales", get(whales::get_whales))
        .route("/api/whales/recent", get(whales::get_recent_whales))
        .route("/api/whales/stats", get(whales::get_whale_stats))
        .route("/api/whales/detect", post(whales::detect_whales))
        .route("/api/insights/hot-markets", get(insights::hot_markets))
        .route(
            "/api/insights/volume-anomalies",
            get(insights::volume_anomalies),
        )
        .route("/api/insights/smart-money", get(insights::smart_money))
        .route("/api/traders/top", get(traders::get_leaderboard))
        .route("/api/traders/search", get(traders::search_traders))
        .route("/api/traders/{address}", get(traders::get_trader_summary))
        .route(
            "/api/traders/{address}/trades",
            get(traders::get_trader_trades),
        )
        .route(
            "/api/traders/{address}/positions",
            get(traders::get_trader_positions),
        )
        .route("/api/traders/{address}/stats", get(traders::get_trader_stats))
        .route("/api/traders/{address}/value", get(traders::get_trader_value))
        .route(
            "/api/traders/{address}/pnl-history",
            get(traders::get_trader_pnl_history),
        )
        .route("/api/ws/whales", get(ws::ws_whales))
        .route("/api/ws/trades", get(ws::ws_trades))
        .route("/api/ws/status", get(ws::ws_status))
        .layer(cors)
        .with_state(state)
}

pub async fn run(state: AppState, host: &str, port: u16) -> Result<()> {
    let scheduler = state.scheduler.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!("API server listening on {host}:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight sync finishes on its own; we only stop taking new ticks.
    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
