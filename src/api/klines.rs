//! Kline endpoints: candles, latest price and price range, all computed on
//! the fly from trades.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::server::AppState;
use crate::core::db::store;
use crate::core::klines::{Kline, KlineAggregator, PriceRange, interval_seconds};

#[derive(Deserialize)]
pub struct KlinesQuery {
    pub market_id: i64,
    pub interval: Option<String>,
    pub limit: Option<usize>,
    pub token_id: Option<String>,
}

#[derive(Serialize)]
pub struct KlineResponse {
    pub market_id: i64,
    pub interval: String,
    pub klines: Vec<Kline>,
}

/// Looks the market up and substitutes its YES token when the caller didn't
/// pin one. Errors 404 when the market doesn't exist.
async fn resolve_token(
    state: &AppState,
    market_id: i64,
    token_id: Option<String>,
) -> ApiResult<Option<String>> {
    let yes_token = state
        .store
        .call(move |conn| store::market_yes_token(conn, market_id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Market not found".into()))?;
    Ok(token_id.or(yes_token))
}

pub async fn get_klines(
    State(state): State<AppState>,
    Query(params): Query<KlinesQuery>,
) -> ApiResult<Json<KlineResponse>> {
    let interval = params.interval.unwrap_or_else(|| "1h".into());
    let interval_secs = interval_seconds(&interval)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown interval: {interval}")))?;
    let limit = params.limit.unwrap_or(100).min(1000);

    let token = resolve_token(&state, params.market_id, params.token_id).await?;
    let klines = KlineAggregator::new(state.store.clone())
        .klines(params.market_id, interval_secs, limit, token)
        .await?;

    Ok(Json(KlineResponse {
        market_id: params.market_id,
        interval,
        klines,
    }))
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token_id: Option<String>,
}

pub async fn get_latest_price(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<TokenQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = resolve_token(&state, market_id, params.token_id).await?;
    let latest = KlineAggregator::new(state.store.clone())
        .latest_price(market_id, token)
        .await?;
    let (price, timestamp) = match latest {
        Some((price, timestamp)) => (Some(price), Some(timestamp)),
        None => (None, None),
    };
    Ok(Json(serde_json::json!({
        "price": price,
        "timestamp": timestamp,
    })))
}

#[derive(Deserialize)]
pub struct RangeQuery {
    pub token_id: Option<String>,
    pub hours: Option<i64>,
}

pub async fn get_price_range(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<RangeQuery>,
) -> ApiResult<Json<PriceRange>> {
    let hours = params.hours.unwrap_or(24).max(1);
    let token = resolve_token(&state, market_id, params.token_id).await?;
    let range = KlineAggregator::new(state.store.clone())
        .price_range(market_id, token, hours)
        .await?;
    Ok(Json(range))
}
