//! Trader profile endpoints, proxied from the Polymarket Data API and Gamma
//! with whale-level enrichment. No local state beyond two TTL caches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};

use super::error::{ApiError, ApiResult};
use super::levels::{self, calc_whale_level};
use super::server::AppState;
use super::types::{
    ActivityItem, DataApiPosition, DataApiTrade, LeaderboardEntry, PublicProfile,
};
use crate::core::discovery::{GammaEvent, extract_category};

const DATA_API_TIMEOUT: Duration = Duration::from_secs(20);
const EVENT_CATEGORY_TTL: Duration = Duration::from_secs(600);
const CATEGORY_CONCURRENCY: usize = 10;

/// event slug → category, shared across requests.
pub type EventCategoryCache = Arc<RwLock<HashMap<String, (Instant, String)>>>;

pub fn new_event_category_cache() -> EventCategoryCache {
    Arc::new(RwLock::new(HashMap::new()))
}

fn validate_address(address: &str) -> ApiResult<String> {
    if levels::is_address(address) {
        Ok(address.to_lowercase())
    } else {
        Err(ApiError::BadRequest("Invalid wallet address".into()))
    }
}

fn normalize_ts(ts: i64) -> i64 {
    // Some endpoints report milliseconds; anything past 2100 in seconds is one.
    if ts > 4_102_444_800 { ts / 1000 } else { ts }
}

async fn data_api_get<T: DeserializeOwned>(
    state: &AppState,
    path: &str,
    params: &[(&str, String)],
) -> ApiResult<T> {
    let resp = state
        .http
        .get(format!("{}{path}", state.cfg.data_api_base))
        .query(params)
        .timeout(DATA_API_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            ApiError::Upstream(StatusCode::BAD_GATEWAY, format!("Data API request failed: {e}"))
        })?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Upstream(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            body,
        ));
    }
    resp.json().await.map_err(|e| {
        ApiError::Upstream(StatusCode::BAD_GATEWAY, format!("Data API parse failed: {e}"))
    })
}

/// Best-effort variant: upstream trouble degrades to `None` with a warning.
async fn data_api_try<T: DeserializeOwned>(
    state: &AppState,
    path: &str,
    params: &[(&str, String)],
) -> Option<T> {
    match data_api_get(state, path, params).await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Data API {path} degraded: {e:?}");
            None
        }
    }
}

async fn fetch_trades(state: &AppState, address: &str, max_records: usize) -> Vec<DataApiTrade> {
    let limit = max_records.min(10_000);
    let mut trades: Vec<DataApiTrade> = data_api_try(
        state,
        "/trades",
        &[
            ("user", address.to_string()),
            ("takerOnly", "false".into()),
            ("limit", limit.to_string()),
            ("offset", "0".into()),
        ],
    )
    .await
    .unwrap_or_default();
    trades.truncate(max_records);
    trades
}

// ---------------------------------------------------------------------------
// /traders/top and /traders/search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LeaderboardQuery {
    #[serde(rename = "orderBy")]
    pub order_by: Option<String>,
    pub category: Option<String>,
    #[serde(rename = "timePeriod")]
    pub time_period: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(rename = "includeLevels")]
    pub include_levels: Option<bool>,
}

#[derive(Serialize)]
pub struct LeaderboardResponse {
    pub traders: Vec<LeaderboardEntry>,
}

pub async fn get_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<LeaderboardQuery>,
) -> ApiResult<Json<LeaderboardResponse>> {
    let limit = params.limit.unwrap_or(25).clamp(1, 50);
    let offset = params.offset.unwrap_or(0).min(1000);
    let mut traders: Vec<LeaderboardEntry> = data_api_get(
        &state,
        "/v1/leaderboard",
        &[
            ("orderBy", params.order_by.unwrap_or_else(|| "PNL".into())),
            ("category", params.category.unwrap_or_else(|| "OVERALL".into())),
            ("timePeriod", params.time_period.unwrap_or_else(|| "DAY".into())),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ],
    )
    .await?;

    if params.include_levels.unwrap_or(false) && !traders.is_empty() {
        let addresses: Vec<String> = traders
            .iter()
            .filter_map(|t| t.proxy_wallet.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let level_map =
            levels::compute_levels_for(&state.http, &state.cfg, &state.levels, &addresses).await;
        for trader in &mut traders {
            if let Some(address) = &trader.proxy_wallet {
                trader.whale_level = level_map.get(address).cloned().flatten();
            }
        }
    }

    Ok(Json(LeaderboardResponse { traders }))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub results: Vec<String>,
}

/// Address-prefix search. Full addresses (and 0x prefixes) echo back
/// normalized; free-text search has no upstream to delegate to.
pub async fn search_traders(Query(params): Query<SearchQuery>) -> Json<SearchResponse> {
    let query = params.q.unwrap_or_default().trim().to_string();
    let results = if query.is_empty() {
        Vec::new()
    } else if levels::is_address(&query) || query.starts_with("0x") {
        vec![query.to_lowercase()]
    } else {
        Vec::new()
    };
    Json(SearchResponse { results })
}

// ---------------------------------------------------------------------------
// /traders/{address}
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct TraderSummaryResponse {
    pub address: String,
    pub positions_value: Option<f64>,
    pub predictions: Option<i64>,
    pub pnl: Option<f64>,
    pub biggest_win: Option<f64>,
    pub win_rate: Option<f64>,
    pub trade_count: Option<usize>,
    pub total_volume: Option<f64>,
    pub first_trade: Option<String>,
    pub last_trade: Option<String>,
    pub active_days: Option<usize>,
    pub whale_level: Option<String>,
    pub max_trade_value: f64,
    pub max_market_volume: f64,
    pub display_username_public: Option<bool>,
    pub name: Option<String>,
    pub pseudonym: Option<String>,
    pub bio: Option<String>,
    pub profile_image: Option<String>,
    pub x_username: Option<String>,
    pub verified_badge: Option<bool>,
    pub proxy_wallet: Option<String>,
    pub data_partial: bool,
}

async fn fetch_profile(state: &AppState, address: &str) -> Option<PublicProfile> {
    let resp = state
        .http
        .get(format!("{}/public-profile", state.cfg.gamma_profile_base))
        .query(&[("address", address)])
        .timeout(DATA_API_TIMEOUT)
        .send()
        .await
        .ok()?;
    resp.json().await.ok()
}

/// `/value`, falling back to summing `/positions` current values.
async fn fetch_positions_value(state: &AppState, address: &str) -> Option<f64> {
    if let Some(value) = data_api_try::<serde_json::Value>(
        state,
        "/value",
        &[("user", address.to_string())],
    )
    .await
    {
        let extracted = match &value {
            serde_json::Value::Object(obj) => obj.get("value").and_then(value_as_f64),
            serde_json::Value::Array(items) => items
                .first()
                .and_then(|v| v.get("value"))
                .and_then(value_as_f64),
            _ => None,
        };
        if extracted.is_some() {
            return extracted;
        }
    }

    let positions: Vec<DataApiPosition> = data_api_try(
        state,
        "/positions",
        &[("user", address.to_string()), ("limit", "500".into())],
    )
    .await
    .unwrap_or_default();
    if positions.is_empty() {
        return None;
    }
    let total: f64 = positions.iter().filter_map(|p| p.current_value).sum();
    (total > 0.0).then_some(total)
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

async fn fetch_predictions(state: &AppState, address: &str) -> Option<i64> {
    let value: serde_json::Value =
        data_api_try(state, "/traded", &[("user", address.to_string())]).await?;
    value.get("traded").and_then(|v| v.as_i64())
}

async fn fetch_pnl(state: &AppState, address: &str) -> Option<f64> {
    let rows: Vec<LeaderboardEntry> = data_api_try(
        state,
        "/v1/leaderboard",
        &[
            ("user", address.to_string()),
            ("timePeriod", "ALL".into()),
            ("orderBy", "PNL".into()),
            ("limit", "1".into()),
        ],
    )
    .await?;
    rows.first().and_then(|row| row.pnl)
}

async fn fetch_biggest_win(state: &AppState, address: &str) -> Option<f64> {
    let positions: Vec<DataApiPosition> = data_api_try(
        state,
        "/closed-positions",
        &[
            ("user", address.to_string()),
            ("limit", "500".into()),
            ("sortBy", "REALIZEDPNL".into()),
            ("sortDirection", "DESC".into()),
        ],
    )
    .await?;
    let max_win = positions
        .iter()
        .filter_map(|p| p.realized_pnl)
        .fold(0.0f64, f64::max);
    (max_win > 0.0).then_some(max_win)
}

/// Share of positions whose PnL (cash first, realized as fallback) is
/// positive, as a percentage.
async fn fetch_win_rate(state: &AppState, address: &str) -> Option<f64> {
    let positions: Vec<DataApiPosition> = data_api_try(
        state,
        "/positions",
        &[("user", address.to_string()), ("limit", "500".into())],
    )
    .await?;
    if positions.is_empty() {
        return None;
    }

    let mut winning = 0usize;
    let mut losing = 0usize;
    for position in &positions {
        let realized = position.realized_pnl.unwrap_or(0.0);
        let cash = position.cash_pnl.unwrap_or(0.0);
        let pnl = if cash != 0.0 { cash } else { realized };
        if pnl > 0.0 {
            winning += 1;
        } else if pnl < 0.0 {
            losing += 1;
        }
    }
    let total = winning + losing;
    if total == 0 {
        return None;
    }
    Some((winning as f64 / total as f64 * 1000.0).round() / 10.0)
}

pub async fn get_trader_summary(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<TraderSummaryResponse>> {
    let normalized = validate_address(&address)?;
    let max_records = state.cfg.trader_stats_max_trades;

    let (profile, positions_value, predictions, pnl, biggest_win, win_rate, trades) = tokio::join!(
        fetch_profile(&state, &normalized),
        fetch_positions_value(&state, &normalized),
        fetch_predictions(&state, &normalized),
        fetch_pnl(&state, &normalized),
        fetch_biggest_win(&state, &normalized),
        fetch_win_rate(&state, &normalized),
        fetch_trades(&state, &normalized, max_records),
    );
    let profile = profile.unwrap_or_default();

    if trades.is_empty() {
        return Ok(Json(TraderSummaryResponse {
            address,
            positions_value,
            predictions,
            pnl,
            biggest_win,
            win_rate,
            trade_count: Some(0),
            total_volume: Some(0.0),
            first_trade: None,
            last_trade: None,
            active_days: None,
            whale_level: None,
            max_trade_value: 0.0,
            max_market_volume: 0.0,
            display_username_public: profile.display_username_public,
            name: profile.name,
            pseudonym: profile.pseudonym,
            bio: profile.bio,
            profile_image: profile.profile_image,
            x_username: profile.x_username,
            verified_badge: profile.verified_badge,
            proxy_wallet: profile.proxy_wallet,
            data_partial: false,
        }));
    }

    let mut total_volume = 0.0f64;
    let mut max_trade_value = 0.0f64;
    let mut market_totals: HashMap<String, f64> = HashMap::new();
    let mut timestamps: Vec<i64> = Vec::new();
    let mut active_days: HashSet<chrono::NaiveDate> = HashSet::new();

    for trade in &trades {
        let usd = trade.usd();
        total_volume += usd;
        max_trade_value = max_trade_value.max(usd);
        if let Some(condition_id) = &trade.condition_id {
            *market_totals.entry(condition_id.clone()).or_insert(0.0) += usd;
        }
        if let Some(ts) = trade.timestamp {
            let ts = normalize_ts(ts);
            timestamps.push(ts);
            if let Some(dt) = chrono::DateTime::from_timestamp(ts, 0) {
                active_days.insert(dt.date_naive());
            }
        }
    }
    let max_market_volume = market_totals.values().copied().fold(0.0f64, f64::max);

    let first_trade = timestamps
        .iter()
        .min()
        .map(|ts| crate::core::indexer::iso_utc(*ts as u64));
    let last_trade = timestamps
        .iter()
        .max()
        .map(|ts| crate::core::indexer::iso_utc(*ts as u64));

    // When the fetch hits its cap, the windowed aggregates would silently
    // undercount; flag and null them instead.
    let is_partial = trades.len() >= max_records;
    let whale_level = Some(calc_whale_level(max_trade_value, max_market_volume).to_string());

    Ok(Json(TraderSummaryResponse {
        address,
        positions_value,
        predictions,
        pnl,
        biggest_win,
        win_rate,
        trade_count: (!is_partial).then_some(trades.len()),
        total_volume: (!is_partial).then_some(total_volume),
        first_trade: if is_partial { None } else { first_trade },
        last_trade: if is_partial { None } else { last_trade },
        active_days: (!is_partial).then_some(active_days.len()),
        whale_level,
        max_trade_value,
        max_market_volume,
        display_username_public: profile.display_username_public,
        name: profile.name,
        pseudonym: profile.pseudonym,
        bio: profile.bio,
        profile_image: profile.profile_image,
        x_username: profile.x_username,
        verified_badge: profile.verified_badge,
        proxy_wallet: profile.proxy_wallet,
        data_partial: is_partial,
    }))
}

// ---------------------------------------------------------------------------
// /traders/{address}/trades
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct TraderTradesQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub side: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub min_usd: Option<f64>,
    pub max_usd: Option<f64>,
}

#[derive(Serialize)]
pub struct TraderTradesResponse {
    pub trades: Vec<DataApiTrade>,
    pub has_more: bool,
    pub offset: usize,
    pub limit: usize,
}

fn parse_iso_ts(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(&value.replace('Z', "+00:00"))
        .ok()
        .map(|dt| dt.timestamp())
}

pub async fn get_trader_trades(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<TraderTradesQuery>,
) -> ApiResult<Json<TraderTradesResponse>> {
    let normalized = validate_address(&address)?;
    let limit = params.limit.unwrap_or(50).min(10_000);
    let offset = params.offset.unwrap_or(0);

    let mut query = vec![
        ("user", normalized),
        ("takerOnly", "false".into()),
        ("limit", limit.to_string()),
        ("offset", offset.to_string()),
    ];
    if let Some(side) = &params.side {
        query.push(("side", side.to_uppercase()));
    }
    let mut trades: Vec<DataApiTrade> = data_api_get(&state, "/trades", &query).await?;

    let start_ts = params.start_time.as_deref().and_then(parse_iso_ts);
    let end_ts = params.end_time.as_deref().and_then(parse_iso_ts);
    if start_ts.is_some() || end_ts.is_some() {
        trades.retain(|trade| {
            let Some(ts) = trade.timestamp else { return false };
            if let Some(start) = start_ts {
                if ts < start {
                    return false;
                }
            }
            if let Some(end) = end_ts {
                if ts > end {
                    return false;
                }
            }
            true
        });
    }

    if params.min_usd.is_some() || params.max_usd.is_some() {
        trades.retain(|trade| {
            let usd = trade.usd();
            params.min_usd.is_none_or(|min| usd >= min)
                && params.max_usd.is_none_or(|max| usd <= max)
        });
    }

    for trade in &mut trades {
        trade.usd_value = Some(trade.usd());
    }

    let has_more = trades.len() == limit;
    Ok(Json(TraderTradesResponse {
        trades,
        has_more,
        offset,
        limit,
    }))
}

// ---------------------------------------------------------------------------
// /traders/{address}/positions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PositionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortDirection")]
    pub sort_direction: Option<String>,
}

#[derive(Serialize)]
pub struct PositionSummary {
    pub total_positions: usize,
    pub total_value: f64,
    pub total_unrealized_pnl: f64,
}

#[derive(Serialize)]
pub struct TraderPositionsResponse {
    pub positions: Vec<DataApiPosition>,
    pub summary: PositionSummary,
}

pub async fn get_trader_positions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<PositionsQuery>,
) -> ApiResult<Json<TraderPositionsResponse>> {
    let normalized = validate_address(&address)?;
    let limit = params.limit.unwrap_or(200).min(500);
    let positions: Vec<DataApiPosition> = data_api_get(
        &state,
        "/positions",
        &[
            ("user", normalized),
            ("limit", limit.to_string()),
            ("offset", params.offset.unwrap_or(0).to_string()),
            ("sortBy", params.sort_by.unwrap_or_else(|| "TOKENS".into())),
            (
                "sortDirection",
                params.sort_direction.unwrap_or_else(|| "DESC".into()),
            ),
        ],
    )
    .await?;

    let total_value: f64 = positions.iter().filter_map(|p| p.current_value).sum();
    let total_pnl: f64 = positions.iter().filter_map(|p| p.cash_pnl).sum();
    let summary = PositionSummary {
        total_positions: positions.len(),
        total_value,
        total_unrealized_pnl: total_pnl,
    };

    Ok(Json(TraderPositionsResponse { positions, summary }))
}

// ---------------------------------------------------------------------------
// /traders/{address}/stats
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct TraderStatsResponse {
    pub buy_count: usize,
    pub sell_count: usize,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub yes_preference: f64,
    pub avg_trade_size: f64,
    pub categories: HashMap<String, f64>,
    pub hourly_distribution: Vec<usize>,
}

/// Batch event-slug → category lookup with a TTL cache and bounded fan-out.
async fn fetch_event_categories(
    state: &AppState,
    event_slugs: Vec<String>,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();
    let mut to_fetch = Vec::new();
    {
        let cache = state.event_categories.read().await;
        for slug in event_slugs {
            match cache.get(&slug) {
                Some((stamp, category)) if stamp.elapsed() < EVENT_CATEGORY_TTL => {
                    resolved.insert(slug, category.clone());
                }
                _ => to_fetch.push(slug),
            }
        }
    }
    if to_fetch.is_empty() {
        return resolved;
    }

    tracing::info!("Fetching {} event categories", to_fetch.len());
    let semaphore = Arc::new(Semaphore::new(CATEGORY_CONCURRENCY));
    let mut handles = Vec::new();
    for slug in to_fetch {
        let http = state.http.clone();
        let base = state.cfg.gamma_api_base.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.ok()?;
            let resp = http
                .get(format!("{base}/events"))
                .query(&[("slug", slug.as_str())])
                .timeout(DATA_API_TIMEOUT)
                .send()
                .await
                .ok()?;
            let events: Vec<GammaEvent> = resp.json().await.ok()?;
            let category = events
                .first()
                .and_then(|e| extract_category(&e.category, &e.tags))
                .unwrap_or_else(|| "Other".into());
            Some((slug, category))
        }));
    }

    let mut fetched = Vec::new();
    for handle in handles {
        if let Ok(Some(pair)) = handle.await {
            fetched.push(pair);
        }
    }
    if !fetched.is_empty() {
        let mut cache = state.event_categories.write().await;
        for (slug, category) in fetched {
            cache.insert(slug.clone(), (Instant::now(), category.clone()));
            resolved.insert(slug, category);
        }
    }
    resolved
}

pub async fn get_trader_stats(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<TraderStatsResponse>> {
    use chrono::Timelike;

    let normalized = validate_address(&address)?;
    let trades = fetch_trades(&state, &normalized, state.cfg.trader_stats_max_trades).await;
    tracing::info!("Fetched {} trades for {normalized}", trades.len());

    let mut buy_count = 0usize;
    let mut sell_count = 0usize;
    let mut buy_volume = 0.0f64;
    let mut sell_volume = 0.0f64;
    let mut yes_volume = 0.0f64;
    let mut total_volume = 0.0f64;
    let mut hourly_distribution = vec![0usize; 24];
    let mut volume_by_event: HashMap<String, f64> = HashMap::new();

    for trade in &trades {
        let usd = trade.usd();
        total_volume += usd;
        match trade.side.as_deref().map(str::to_uppercase).as_deref() {
            Some("BUY") => {
                buy_count += 1;
                buy_volume += usd;
            }
            Some("SELL") => {
                sell_count += 1;
                sell_volume += usd;
            }
            _ => {}
        }
        if trade.outcome.as_deref() == Some("YES") || trade.outcome_index == Some(0) {
            yes_volume += usd;
        }
        if let Some(ts) = trade.timestamp {
            if let Some(dt) = chrono::DateTime::from_timestamp(normalize_ts(ts), 0) {
                hourly_distribution[dt.hour() as usize] += 1;
            }
        }
        if let Some(event_slug) = &trade.event_slug {
            *volume_by_event.entry(event_slug.clone()).or_insert(0.0) += usd;
        }
    }

    let avg_trade_size = if trades.is_empty() {
        0.0
    } else {
        total_volume / trades.len() as f64
    };
    let yes_preference = if total_volume > 0.0 {
        yes_volume / total_volume
    } else {
        0.0
    };

    let mut categories: HashMap<String, f64> = HashMap::new();
    if !volume_by_event.is_empty() {
        let slugs: Vec<String> = volume_by_event.keys().cloned().collect();
        let slug_categories = fetch_event_categories(&state, slugs).await;
        for (slug, volume) in &volume_by_event {
            let category = slug_categories
                .get(slug)
                .cloned()
                .unwrap_or_else(|| "Other".into());
            *categories.entry(category).or_insert(0.0) += volume;
        }
    }

    Ok(Json(TraderStatsResponse {
        buy_count,
        sell_count,
        buy_volume,
        sell_volume,
        yes_preference,
        avg_trade_size,
        categories,
        hourly_distribution,
    }))
}

// ---------------------------------------------------------------------------
// /traders/{address}/value and /traders/{address}/pnl-history
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct TraderValueResponse {
    pub value: Option<f64>,
}

pub async fn get_trader_value(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<TraderValueResponse>> {
    let normalized = validate_address(&address)?;
    let payload: serde_json::Value =
        data_api_get(&state, "/value", &[("user", normalized)]).await?;
    let value = match &payload {
        serde_json::Value::Object(obj) => obj.get("value").and_then(value_as_f64),
        serde_json::Value::Array(items) => items
            .first()
            .and_then(|v| v.get("value"))
            .and_then(value_as_f64),
        _ => None,
    };
    Ok(Json(TraderValueResponse { value }))
}

#[derive(Deserialize)]
pub struct PnlHistoryQuery {
    pub period: Option<String>,
}

#[derive(Serialize)]
pub struct PnlDataPoint {
    pub timestamp: i64,
    pub pnl: f64,
}

#[derive(Serialize)]
pub struct PnlHistoryResponse {
    pub data_points: Vec<PnlDataPoint>,
    pub total_pnl: Option<f64>,
    pub period: String,
}

fn period_start(period: &str) -> Option<i64> {
    let now = chrono::Utc::now().timestamp();
    match period.to_uppercase().as_str() {
        "1D" => Some(now - 86_400),
        "1W" => Some(now - 604_800),
        "1M" => Some(now - 2_592_000),
        _ => None,
    }
}

/// Cumulative daily PnL reconstructed from trade activity (sell proceeds
/// minus buy outlays); the headline total comes from the leaderboard.
pub async fn get_trader_pnl_history(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<PnlHistoryQuery>,
) -> ApiResult<Json<PnlHistoryResponse>> {
    let normalized = validate_address(&address)?;
    let period = params.period.unwrap_or_else(|| "ALL".into());

    let mut query = vec![
        ("user", normalized.clone()),
        ("limit", "1000".into()),
        ("type", "TRADE".into()),
    ];
    if let Some(start) = period_start(&period) {
        query.push(("start", start.to_string()));
    }

    let activity: Vec<ActivityItem> = data_api_try(&state, "/activity", &query)
        .await
        .unwrap_or_default();
    if activity.is_empty() {
        return Ok(Json(PnlHistoryResponse {
            data_points: Vec::new(),
            total_pnl: None,
            period,
        }));
    }

    let mut daily_pnl: std::collections::BTreeMap<i64, f64> = std::collections::BTreeMap::new();
    for item in &activity {
        let Some(ts) = item.timestamp else { continue };
        let day = (normalize_ts(ts) / 86_400) * 86_400;
        let usdc = item.usdc_size.unwrap_or(0.0);
        match item.side.as_deref().map(str::to_uppercase).as_deref() {
            Some("SELL") => *daily_pnl.entry(day).or_insert(0.0) += usdc,
            Some("BUY") => *daily_pnl.entry(day).or_insert(0.0) -= usdc,
            _ => {}
        }
    }

    let mut cumulative = 0.0;
    let data_points = daily_pnl
        .into_iter()
        .map(|(timestamp, delta)| {
            cumulative += delta;
            PnlDataPoint {
                timestamp,
                pnl: cumulative,
            }
        })
        .collect();

    let total_pnl = fetch_pnl(&state, &normalized).await;
    Ok(Json(PnlHistoryResponse {
        data_points,
        total_pnl,
        period,
    }))
}
