//! Whale trade endpoints.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use super::error::ApiResult;
use super::server::AppState;
use crate::core::whales::{WhaleDetector, WhaleStats, WhaleTrade};

fn detector(state: &AppState, threshold: Option<f64>) -> WhaleDetector {
    WhaleDetector::new(
        state.store.clone(),
        threshold.unwrap_or(state.cfg.whale_threshold),
    )
}

#[derive(Deserialize)]
pub struct WhalesQuery {
    pub limit: Option<usize>,
    pub min_usd: Option<f64>,
    pub market_id: Option<i64>,
}

#[derive(Serialize)]
pub struct WhaleListResponse {
    pub whales: Vec<WhaleTrade>,
    pub total: i64,
}

/// Whale trades ordered by USD value.
pub async fn get_whales(
    State(state): State<AppState>,
    Query(params): Query<WhalesQuery>,
) -> ApiResult<Json<WhaleListResponse>> {
    let limit = params.limit.unwrap_or(50).min(200);
    let detector = detector(&state, None);
    let min_value = params.min_usd.unwrap_or(detector.threshold());

    let whales = detector.list(limit, params.min_usd, params.market_id).await?;
    let total = detector
        .stats(Some(min_value), params.market_id)
        .await?
        .total_count;

    Ok(Json(WhaleListResponse { whales, total }))
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

pub async fn get_recent_whales(
    State(state): State<AppState>,
    Query(params): Query<RecentQuery>,
) -> ApiResult<Json<WhaleListResponse>> {
    let limit = params.limit.unwrap_or(20).min(100);
    let whales = detector(&state, None).recent(limit).await?;
    let total = whales.len() as i64;
    Ok(Json(WhaleListResponse { whales, total }))
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub min_usd: Option<f64>,
    pub market_id: Option<i64>,
}

pub async fn get_whale_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> ApiResult<Json<WhaleStats>> {
    let stats = detector(&state, None)
        .stats(params.min_usd, params.market_id)
        .await?;
    Ok(Json(stats))
}

#[derive(Deserialize)]
pub struct DetectQuery {
    pub threshold: Option<f64>,
}

/// Manual backfill trigger.
pub async fn detect_whales(
    State(state): State<AppState>,
    Query(params): Query<DetectQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let count = detector(&state, params.threshold).backfill().await?;
    Ok(Json(serde_json::json!({
        "message": format!("Detected {count} whale trades"),
        "count": count,
    })))
}
