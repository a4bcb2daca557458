//! Metrics endpoints over the aggregation engine.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::server::AppState;
use crate::core::db::store;
use crate::core::metrics::{
    BuySellPressure, MarketMetrics, MetricsBundle, TraderStats, VwapReport, WhaleSignal,
    period_seconds,
};

#[derive(Deserialize)]
pub struct MetricsQuery {
    pub token_id: Option<String>,
    pub period: Option<String>,
    pub threshold: Option<f64>,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub market_id: i64,
    pub token_id: Option<String>,
    pub period: String,
    pub metrics: MetricsBundle,
}

struct ResolvedQuery {
    token: Option<String>,
    period: String,
    period_secs: i64,
}

async fn resolve(state: &AppState, market_id: i64, params: &MetricsQuery) -> ApiResult<ResolvedQuery> {
    let period = params.period.clone().unwrap_or_else(|| "24h".into());
    let period_secs = period_seconds(&period)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown period: {period}")))?;

    let yes_token = state
        .store
        .call(move |conn| store::market_yes_token(conn, market_id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Market not found".into()))?;

    Ok(ResolvedQuery {
        token: params.token_id.clone().or(yes_token),
        period,
        period_secs,
    })
}

fn engine(state: &AppState) -> MarketMetrics {
    MarketMetrics::new(state.store.clone(), state.cfg.whale_threshold)
}

pub async fn get_market_metrics(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<MetricsQuery>,
) -> ApiResult<Json<MetricsResponse>> {
    let resolved = resolve(&state, market_id, &params).await?;
    let metrics = engine(&state)
        .all_metrics(market_id, resolved.token.clone(), resolved.period_secs)
        .await?;
    Ok(Json(MetricsResponse {
        market_id,
        token_id: resolved.token,
        period: resolved.period,
        metrics,
    }))
}

pub async fn get_buy_sell_ratio(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<MetricsQuery>,
) -> ApiResult<Json<BuySellPressure>> {
    let resolved = resolve(&state, market_id, &params).await?;
    let pressure = engine(&state)
        .buy_sell_pressure(market_id, resolved.token, resolved.period_secs)
        .await?;
    Ok(Json(pressure))
}

pub async fn get_vwap(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<MetricsQuery>,
) -> ApiResult<Json<VwapReport>> {
    let resolved = resolve(&state, market_id, &params).await?;
    let vwap = engine(&state)
        .vwap(market_id, resolved.token, resolved.period_secs)
        .await?;
    Ok(Json(vwap))
}

pub async fn get_whale_signal(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<MetricsQuery>,
) -> ApiResult<Json<WhaleSignal>> {
    let resolved = resolve(&state, market_id, &params).await?;
    let signal = engine(&state)
        .whale_signal(market_id, resolved.token, resolved.period_secs, params.threshold)
        .await?;
    Ok(Json(signal))
}

pub async fn get_trader_stats(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<MetricsQuery>,
) -> ApiResult<Json<TraderStats>> {
    let resolved = resolve(&state, market_id, &params).await?;
    let stats = engine(&state)
        .trader_stats(market_id, resolved.token, resolved.period_secs)
        .await?;
    Ok(Json(stats))
}
