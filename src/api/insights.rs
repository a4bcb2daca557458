//! Insight report endpoints: hot markets, volume anomalies, smart money.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::server::AppState;
use crate::core::insights::{HotMarket, Insights, SmartMoneyMarket, VolumeAnomaly};
use crate::core::metrics::period_seconds;

fn insights(state: &AppState) -> Insights {
    Insights::new(state.store.clone())
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct HotMarketsResponse {
    pub markets: Vec<HotMarket>,
}

pub async fn hot_markets(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> ApiResult<Json<HotMarketsResponse>> {
    let limit = params.limit.unwrap_or(20).min(100);
    let markets = insights(&state).hot_markets(limit).await?;
    Ok(Json(HotMarketsResponse { markets }))
}

#[derive(Serialize)]
pub struct AnomaliesResponse {
    pub anomalies: Vec<VolumeAnomaly>,
}

pub async fn volume_anomalies(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> ApiResult<Json<AnomaliesResponse>> {
    let limit = params.limit.unwrap_or(20).min(100);
    let anomalies = insights(&state).volume_anomalies(limit).await?;
    Ok(Json(AnomaliesResponse { anomalies }))
}

#[derive(Deserialize)]
pub struct SmartMoneyQuery {
    pub period: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct SmartMoneyResponse {
    pub period: String,
    pub markets: Vec<SmartMoneyMarket>,
}

pub async fn smart_money(
    State(state): State<AppState>,
    Query(params): Query<SmartMoneyQuery>,
) -> ApiResult<Json<SmartMoneyResponse>> {
    let period = params.period.unwrap_or_else(|| "24h".into());
    let period_secs = period_seconds(&period)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown period: {period}")))?;
    let limit = params.limit.unwrap_or(20).min(100);
    let markets = insights(&state).smart_money(period_secs, limit).await?;
    Ok(Json(SmartMoneyResponse { period, markets }))
}
