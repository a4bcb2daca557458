//! Market read endpoints plus the holders proxy.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult, upstream_error};
use super::levels;
use super::server::AppState;
use super::types::Holder;

const HOLDERS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

const ALLOWED_SORTS: &[&str] = &[
    "volume_desc",
    "volume_asc",
    "trades_desc",
    "trades_asc",
    "newest",
    "ending_soon",
];

#[derive(Deserialize)]
pub struct MarketsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub sort: Option<String>,
    pub search: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MarketResponse {
    pub id: i64,
    pub slug: String,
    pub question: Option<String>,
    pub status: Option<String>,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
    pub outcomes: Option<String>,
    pub outcome_prices: Option<String>,
    pub trade_count: i64,
    pub volume_24h: f64,
    pub unique_traders_24h: i64,
    pub image: Option<String>,
    pub icon: Option<String>,
    pub category: Option<String>,
    pub end_date: Option<String>,
    pub volume: f64,
    pub liquidity: f64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub latest_yes_price: Option<f64>,
    pub latest_no_price: Option<f64>,
    pub event_slug: Option<String>,
}

#[derive(Serialize)]
pub struct MarketListResponse {
    pub markets: Vec<MarketResponse>,
    pub total: i64,
    pub has_more: bool,
}

const MARKET_COLUMNS: &str = "m.id, m.slug, m.question, m.status, m.yes_token_id, m.no_token_id,
    m.outcomes, m.outcome_prices, m.trade_count, m.volume_24h, m.unique_traders_24h,
    m.image, m.icon, m.category, m.end_date, m.volume, m.liquidity, m.best_bid, m.best_ask,
    e.slug AS event_slug,
    (SELECT price FROM trades WHERE market_id = m.id AND outcome = 'YES'
     ORDER BY timestamp DESC, id DESC LIMIT 1) AS latest_yes_price,
    (SELECT price FROM trades WHERE market_id = m.id AND outcome = 'NO'
     ORDER BY timestamp DESC, id DESC LIMIT 1) AS latest_no_price";

fn market_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketResponse> {
    Ok(MarketResponse {
        id: row.get(0)?,
        slug: row.get(1)?,
        question: row.get(2)?,
        status: row.get(3)?,
        yes_token_id: row.get(4)?,
        no_token_id: row.get(5)?,
        outcomes: row.get(6)?,
        outcome_prices: row.get(7)?,
        trade_count: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        volume_24h: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
        unique_traders_24h: row.get::<_, Option<i64>>(10)?.unwrap_or(0),
        image: row.get(11)?,
        icon: row.get(12)?,
        category: row.get(13)?,
        end_date: row.get(14)?,
        volume: row.get::<_, Option<f64>>(15)?.unwrap_or(0.0),
        liquidity: row.get::<_, Option<f64>>(16)?.unwrap_or(0.0),
        best_bid: row.get(17)?,
        best_ask: row.get(18)?,
        event_slug: row.get(19)?,
        latest_yes_price: row.get(20)?,
        latest_no_price: row.get(21)?,
    })
}

pub async fn list_markets(
    State(state): State<AppState>,
    Query(params): Query<MarketsQuery>,
) -> ApiResult<Json<MarketListResponse>> {
    let limit = params.limit.unwrap_or(20).min(100);
    let offset = params.offset.unwrap_or(0);
    let sort = params.sort.unwrap_or_else(|| "volume_desc".into());
    if !ALLOWED_SORTS.contains(&sort.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "Invalid sort. Allowed: {ALLOWED_SORTS:?}"
        )));
    }

    let status = params.status;
    let category = params.category;
    let search = params.search;

    let response = state
        .store
        .call(move |conn| {
            let mut where_clauses: Vec<String> = Vec::new();
            let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(status) = &status {
                bindings.push(Box::new(status.clone()));
                where_clauses.push(format!("m.status = ?{}", bindings.len()));
            }
            if let Some(category) = &category {
                bindings.push(Box::new(category.clone()));
                where_clauses.push(format!("m.category = ?{}", bindings.len()));
            }
            if let Some(search) = &search {
                bindings.push(Box::new(format!("%{search}%")));
                where_clauses.push(format!("m.question LIKE ?{}", bindings.len()));
            }
            let where_sql = if where_clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", where_clauses.join(" AND "))
            };

            let order_sql = match sort.as_str() {
                "newest" => "ORDER BY m.created_at DESC, m.id DESC",
                "ending_soon" => {
                    "ORDER BY CASE WHEN m.end_date IS NULL THEN 1 ELSE 0 END, m.end_date ASC, m.id DESC"
                }
                "volume_asc" => "ORDER BY COALESCE(m.volume, 0) ASC, m.id DESC",
                "trades_desc" => "ORDER BY COALESCE(m.trade_count, 0) DESC, m.id DESC",
                "trades_asc" => "ORDER BY COALESCE(m.trade_count, 0) ASC, m.id DESC",
                _ => "ORDER BY COALESCE(m.volume, 0) DESC, m.id DESC",
            };

            let total: i64 = {
                let refs: Vec<&dyn rusqlite::ToSql> =
                    bindings.iter().map(|b| b.as_ref()).collect();
                conn.query_row(
                    &format!("SELECT COUNT(*) FROM markets m {where_sql}"),
                    &refs[..],
                    |row| row.get(0),
                )?
            };

            bindings.push(Box::new(limit as i64));
            let limit_idx = bindings.len();
            bindings.push(Box::new(offset as i64));
            let offset_idx = bindings.len();
            let sql = format!(
                "SELECT {MARKET_COLUMNS}
                 FROM markets m
                 LEFT JOIN events e ON m.event_id = e.id
                 {where_sql}
                 {order_sql}
                 LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
            );
            let refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let markets: Vec<MarketResponse> = stmt
                .query_map(&refs[..], market_from_row)?
                .collect::<rusqlite::Result<_>>()?;

            let has_more = (offset + markets.len()) < total as usize;
            Ok(MarketListResponse {
                markets,
                total,
                has_more,
            })
        })
        .await?;

    Ok(Json(response))
}

pub async fn get_market(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
) -> ApiResult<Json<MarketResponse>> {
    let market = state
        .store
        .call(move |conn| {
            let market = conn
                .query_row(
                    &format!(
                        "SELECT {MARKET_COLUMNS}
                         FROM markets m
                         LEFT JOIN events e ON m.event_id = e.id
                         WHERE m.id = ?1"
                    ),
                    rusqlite::params![market_id],
                    market_from_row,
                )
                .optional()?;
            Ok(market)
        })
        .await?;

    market
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Market not found".into()))
}

pub async fn get_market_price(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let found = state
        .store
        .call(move |conn| {
            let tokens = conn
                .query_row(
                    "SELECT yes_token_id, no_token_id FROM markets WHERE id = ?1",
                    rusqlite::params![market_id],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                        ))
                    },
                )
                .optional()?;
            let Some((yes_token, no_token)) = tokens else {
                return Ok(None);
            };

            let latest = |outcome: &str| -> rusqlite::Result<Option<f64>> {
                conn.query_row(
                    "SELECT price FROM trades
                     WHERE market_id = ?1 AND outcome = ?2
                     ORDER BY timestamp DESC, id DESC LIMIT 1",
                    rusqlite::params![market_id, outcome],
                    |row| row.get(0),
                )
                .optional()
            };
            let yes_price = latest("YES")?;
            let no_price = latest("NO")?;
            Ok(Some(serde_json::json!({
                "market_id": market_id,
                "yes_price": yes_price,
                "no_price": no_price,
                "yes_token_id": yes_token,
                "no_token_id": no_token,
            })))
        })
        .await?;

    found
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Market not found".into()))
}

#[derive(Deserialize)]
pub struct HoldersQuery {
    pub limit: Option<usize>,
    #[serde(rename = "includeLevels")]
    pub include_levels: Option<bool>,
}

#[derive(Serialize)]
pub struct MarketHoldersResponse {
    pub token: Option<String>,
    pub holders: Vec<Holder>,
    pub yes_holders: Vec<Holder>,
    pub no_holders: Vec<Holder>,
}

/// Top holders, proxied from the Data API and keyed by the market's
/// condition id. Preserves the API's per-outcome ordering.
pub async fn get_market_holders(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Query(params): Query<HoldersQuery>,
) -> ApiResult<Json<MarketHoldersResponse>> {
    let limit = params.limit.unwrap_or(10).min(20);

    let condition_id: Option<String> = state
        .store
        .call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT condition_id FROM markets WHERE id = ?1",
                    rusqlite::params![market_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(row)
        })
        .await?;
    let condition_id = condition_id.ok_or_else(|| ApiError::NotFound("Market not found".into()))?;

    let resp = state
        .http
        .get(format!("{}/holders", state.cfg.data_api_base))
        .query(&[
            ("market", condition_id.as_str()),
            ("limit", &limit.to_string()),
        ])
        .timeout(HOLDERS_TIMEOUT)
        .send()
        .await
        .map_err(|e| upstream_error("Failed to fetch holders", e))?;
    if resp.status().is_client_error() || resp.status().is_server_error() {
        return Err(ApiError::Upstream(
            StatusCode::BAD_GATEWAY,
            format!("Failed to fetch holders: HTTP {}", resp.status()),
        ));
    }
    let payload: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| upstream_error("Failed to parse holders", e))?;

    // The endpoint answers either a list of per-token groups or one group.
    let mut token = None;
    let mut holders: Vec<Holder> = Vec::new();
    match &payload {
        serde_json::Value::Array(groups) => {
            for group in groups {
                if let Some(group_holders) = group.get("holders").and_then(|h| h.as_array()) {
                    holders.extend(
                        group_holders
                            .iter()
                            .filter_map(|h| serde_json::from_value(h.clone()).ok()),
                    );
                }
            }
        }
        serde_json::Value::Object(obj) => {
            token = obj.get("token").and_then(|t| t.as_str()).map(String::from);
            if let Some(group_holders) = obj.get("holders").and_then(|h| h.as_array()) {
                holders.extend(
                    group_holders
                        .iter()
                        .filter_map(|h| serde_json::from_value(h.clone()).ok()),
                );
            }
        }
        _ => {}
    }

    if params.include_levels.unwrap_or(false) && !holders.is_empty() {
        let addresses: Vec<String> = holders
            .iter()
            .filter_map(|h| h.proxy_wallet.clone())
            .collect();
        let level_map =
            levels::compute_levels_for(&state.http, &state.cfg, &state.levels, &addresses).await;
        for holder in &mut holders {
            if let Some(address) = &holder.proxy_wallet {
                holder.whale_level = level_map.get(address).cloned().flatten();
            }
        }
    }

    let yes_holders: Vec<Holder> = holders
        .iter()
        .filter(|h| h.outcome_index == Some(0))
        .take(limit)
        .cloned()
        .collect();
    let no_holders: Vec<Holder> = holders
        .iter()
        .filter(|h| h.outcome_index == Some(1))
        .take(limit)
        .cloned()
        .collect();

    Ok(Json(MarketHoldersResponse {
        token,
        holders,
        yes_holders,
        no_holders,
    }))
}
