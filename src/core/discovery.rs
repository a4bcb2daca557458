//! Market discovery against the Gamma metadata API.
//!
//! Pulls event and market payloads, verifies the API's token ids against the
//! local CTF derivation, and upserts everything into the store. HTTP failures
//! log a warning and skip the affected market; they never abort the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::Config;
use crate::core::ctf;
use crate::core::db::store::{self, EventUpsert, MarketRef, MarketUpsert, Store};
use crate::error::Result;

const API_MAX_LIMIT: usize = 500;
const EVENT_TIMEOUT: Duration = Duration::from_secs(15);
const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Gamma payloads
// ---------------------------------------------------------------------------

/// Gamma market payload. Several numeric fields arrive either as numbers or
/// as numeric strings depending on endpoint age; both spellings are
/// normalized at this boundary. Unknown fields are ignored.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    pub condition_id: Option<String>,
    pub slug: Option<String>,
    #[serde(alias = "questionID")]
    pub question_id: Option<String>,
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub neg_risk: Option<bool>,
    pub question: Option<String>,
    pub description: Option<String>,
    /// JSON-encoded string array or plain array, e.g. `"[\"Yes\", \"No\"]"`.
    pub outcomes: Option<serde_json::Value>,
    pub outcome_prices: Option<serde_json::Value>,
    pub clob_token_ids: Option<serde_json::Value>,
    pub active: Option<bool>,
    pub closed: Option<bool>,
    pub archived: Option<bool>,
    pub end_date: Option<String>,
    pub image: Option<String>,
    pub icon: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<serde_json::Value>,
    pub volume_num: Option<f64>,
    pub volume: Option<serde_json::Value>,
    pub volume_24hr: Option<f64>,
    pub liquidity_num: Option<f64>,
    pub liquidity: Option<serde_json::Value>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    #[serde(default)]
    pub events: Vec<GammaEvent>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaEvent {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub image: Option<String>,
    pub icon: Option<String>,
    pub active: Option<bool>,
    pub closed: Option<bool>,
    pub archived: Option<bool>,
    pub enable_neg_risk: Option<bool>,
    #[serde(default)]
    pub tags: Vec<serde_json::Value>,
}

/// Category preference: explicit `category`, else the first tag label that
/// isn't the catch-all "All".
pub fn extract_category(category: &Option<String>, tags: &[serde_json::Value]) -> Option<String> {
    if let Some(cat) = category {
        if !cat.is_empty() {
            return Some(cat.clone());
        }
    }
    tags.iter()
        .filter_map(|tag| match tag {
            serde_json::Value::Object(map) => map.get("label").and_then(|l| l.as_str()),
            serde_json::Value::String(s) => Some(s.as_str()),
            _ => None,
        })
        .find(|label| !label.is_empty() && !label.eq_ignore_ascii_case("all"))
        .map(str::to_string)
}

/// First two entries of a `clobTokenIds` payload (JSON array or JSON-encoded
/// string array).
pub fn parse_clob_token_ids(value: &Option<serde_json::Value>) -> (Option<String>, Option<String>) {
    let ids = parse_string_list(value);
    if ids.len() >= 2 {
        (Some(ids[0].clone()), Some(ids[1].clone()))
    } else {
        (None, None)
    }
}

pub fn parse_string_list(value: &Option<serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => serde_json::from_str(s).unwrap_or_default(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn as_f64(value: &Option<serde_json::Value>) -> Option<f64> {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Canonical stored form for array-ish payload fields: the JSON-encoded
/// string the API usually sends, re-serialized when it sent a real array.
fn stringified(value: &Option<serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => serde_json::to_string(other).ok(),
        None => None,
    }
}

/// Stored form of a market payload's outcome prices.
pub fn stringified_prices(market: &GammaMarket) -> Option<String> {
    stringified(&market.outcome_prices)
}

/// Lifecycle status implied by a market payload.
pub fn market_status(market: &GammaMarket) -> String {
    status_of(market.active, market.closed, market.archived)
}

fn status_of(active: Option<bool>, closed: Option<bool>, archived: Option<bool>) -> String {
    if archived.unwrap_or(false) {
        "archived".into()
    } else if closed.unwrap_or(false) || active == Some(false) {
        "closed".into()
    } else {
        "active".into()
    }
}

// ---------------------------------------------------------------------------
// Token-id verification
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct TokenVerification {
    pub verified: bool,
    pub calculated_yes: Option<String>,
    pub calculated_no: Option<String>,
    pub collateral_token: Option<String>,
    pub warning: Option<String>,
}

/// Derives the token ids locally and compares them with the API's pair.
/// A mismatch is recorded as a warning, never an error.
pub fn verify_token_ids(
    cfg: &Config,
    condition_id: &str,
    is_neg_risk: bool,
    gamma_yes: Option<&str>,
    gamma_no: Option<&str>,
) -> TokenVerification {
    let collateral = if is_neg_risk {
        &cfg.wrapped_collateral
    } else {
        &cfg.usdc_e
    };

    let derived = match ctf::derive_token_ids(condition_id, collateral) {
        Ok(d) => d,
        Err(e) => {
            return TokenVerification {
                warning: Some(format!("Failed to calculate token IDs: {e}")),
                ..Default::default()
            };
        }
    };

    let mut result = TokenVerification {
        verified: false,
        calculated_yes: Some(derived.yes_token_id.clone()),
        calculated_no: Some(derived.no_token_id.clone()),
        collateral_token: Some(derived.collateral_token),
        warning: None,
    };

    match (gamma_yes, gamma_no) {
        (Some(yes), Some(no)) => {
            if yes == derived.yes_token_id && no == derived.no_token_id {
                result.verified = true;
            } else {
                result.warning = Some(format!(
                    "Token ID mismatch. Gamma YES: {}..., calculated: {}...",
                    &yes[..yes.len().min(20)],
                    &derived.yes_token_id[..derived.yes_token_id.len().min(20)],
                ));
            }
        }
        _ => {
            result.warning = Some("No clobTokenIds from Gamma API to verify".into());
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Discovery service
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct DiscoveryReport {
    pub event_id: Option<i64>,
    pub markets_found: usize,
    pub markets_saved: usize,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct Discovery {
    http: reqwest::Client,
    cfg: Arc<Config>,
    store: Store,
}

impl Discovery {
    pub fn new(http: reqwest::Client, cfg: Arc<Config>, store: Store) -> Self {
        Self { http, cfg, store }
    }

    async fn fetch_event(&self, slug: &str) -> Option<GammaEvent> {
        let url = format!("{}/events", self.cfg.gamma_api_base);
        let resp = self
            .http
            .get(&url)
            .query(&[("slug", slug)])
            .timeout(EVENT_TIMEOUT)
            .send()
            .await;
        match resp {
            Ok(r) => match r.json::<Vec<GammaEvent>>().await {
                Ok(events) => events.into_iter().next(),
                Err(e) => {
                    tracing::warn!("Failed to parse event from Gamma API: {e}");
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Failed to fetch event from Gamma API: {e}");
                None
            }
        }
    }

    async fn fetch_markets_page(&self, query: &[(&str, String)]) -> Option<Vec<GammaMarket>> {
        let url = format!("{}/markets", self.cfg.gamma_api_base);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .timeout(PAGE_TIMEOUT)
            .send()
            .await;
        match resp {
            Ok(r) => match r.json::<Vec<GammaMarket>>().await {
                Ok(markets) => Some(markets),
                Err(e) => {
                    tracing::warn!("Failed to parse markets from Gamma API: {e}");
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Failed to fetch markets from Gamma API: {e}");
                None
            }
        }
    }

    async fn fetch_markets(
        &self,
        event_slug: Option<&str>,
        active_only: bool,
        limit: Option<usize>,
        fetch_all: bool,
    ) -> Vec<GammaMarket> {
        let base_query = |page_limit: usize, offset: usize| {
            let mut q: Vec<(&str, String)> = Vec::new();
            if let Some(slug) = event_slug {
                q.push(("slug", slug.to_string()));
            }
            if active_only {
                q.push(("closed", "false".into()));
            }
            q.push(("limit", page_limit.to_string()));
            if offset > 0 {
                q.push(("offset", offset.to_string()));
            }
            q
        };

        if !fetch_all {
            let page_limit = limit.map(|l| l.min(API_MAX_LIMIT)).unwrap_or(API_MAX_LIMIT);
            return self
                .fetch_markets_page(&base_query(page_limit, 0))
                .await
                .unwrap_or_default();
        }

        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            tracing::info!("Fetching markets offset={offset}...");
            let Some(batch) = self.fetch_markets_page(&base_query(API_MAX_LIMIT, offset)).await
            else {
                break;
            };
            let batch_len = batch.len();
            all.extend(batch);
            if batch_len < API_MAX_LIMIT {
                break;
            }
            offset += API_MAX_LIMIT;
            if let Some(cap) = limit {
                if all.len() >= cap {
                    all.truncate(cap);
                    break;
                }
            }
        }
        all
    }

    fn event_upsert_of(event: &GammaEvent, fallback_slug: Option<&str>) -> Option<EventUpsert> {
        let slug = event
            .slug
            .clone()
            .or_else(|| fallback_slug.map(str::to_string))?;
        Some(EventUpsert {
            slug,
            title: event.title.clone(),
            description: event.description.clone(),
            category: extract_category(&event.category, &event.tags),
            start_date: event.start_date.clone(),
            end_date: event.end_date.clone(),
            image: event.image.clone(),
            icon: event.icon.clone(),
            status: Some(status_of(event.active, event.closed, event.archived)),
            enable_neg_risk: event.enable_neg_risk,
        })
    }

    /// Upserts one market (and, when embedded, its parent event). Returns
    /// `(market_id, warning)`; `None` id means the payload was unusable.
    async fn process_market(
        &self,
        market: &GammaMarket,
        known_event_id: Option<i64>,
    ) -> Result<(Option<i64>, Option<String>)> {
        let Some(condition_id) = market.condition_id.clone() else {
            return Ok((
                None,
                Some(format!(
                    "Market {} has no conditionId, skipped",
                    market.slug.as_deref().unwrap_or("?")
                )),
            ));
        };
        let slug = market.slug.clone().unwrap_or_else(|| condition_id.clone());
        let is_neg_risk = market.neg_risk.unwrap_or(false);

        // Category preference: market, then embedded parent event.
        let mut category = extract_category(&market.category, &market.tags);
        let embedded_event = market.events.first().cloned();
        if category.is_none() {
            if let Some(event) = &embedded_event {
                category = extract_category(&event.category, &event.tags);
            }
        }

        let (gamma_yes, gamma_no) = parse_clob_token_ids(&market.clob_token_ids);
        let verification = verify_token_ids(
            &self.cfg,
            &condition_id,
            is_neg_risk,
            gamma_yes.as_deref(),
            gamma_no.as_deref(),
        );
        let warning = verification.warning.clone();

        // Prefer the locally derived ids; fall back to the API's pair.
        let (yes_token_id, no_token_id, collateral_token) = if verification.calculated_yes.is_some()
        {
            (
                verification.calculated_yes,
                verification.calculated_no,
                verification.collateral_token,
            )
        } else {
            (gamma_yes, gamma_no, None)
        };

        let event_payload = if known_event_id.is_none() {
            embedded_event
                .as_ref()
                .and_then(|e| Self::event_upsert_of(e, None))
        } else {
            None
        };

        let upsert = MarketUpsert {
            event_id: known_event_id,
            slug,
            condition_id,
            question_id: market.question_id.clone(),
            oracle: market.resolved_by.clone(),
            collateral_token,
            yes_token_id,
            no_token_id,
            enable_neg_risk: Some(is_neg_risk),
            status: Some(status_of(market.active, market.closed, market.archived)),
            question: market.question.clone(),
            description: market.description.clone(),
            outcomes: stringified(&market.outcomes),
            outcome_prices: stringified(&market.outcome_prices),
            end_date: market.end_date.clone(),
            image: market.image.clone(),
            icon: market.icon.clone(),
            category,
            volume: market.volume_num.or_else(|| as_f64(&market.volume)),
            volume_24h: market.volume_24hr,
            liquidity: market.liquidity_num.or_else(|| as_f64(&market.liquidity)),
            best_bid: market.best_bid,
            best_ask: market.best_ask,
            sync_warning: warning.clone(),
        };

        let market_id = self
            .store
            .call(move |conn| {
                let mut upsert = upsert;
                if let Some(event) = event_payload {
                    let event_id = store::upsert_event(conn, &event)?;
                    upsert.event_id = Some(event_id);
                }
                store::upsert_market(conn, &upsert)
            })
            .await?;

        Ok((Some(market_id), warning))
    }

    /// `discover_by_event_slug`: upsert the event, then every market under it.
    pub async fn discover_by_event_slug(&self, event_slug: &str) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();

        let mut event_category = None;
        if let Some(event) = self.fetch_event(event_slug).await {
            event_category = extract_category(&event.category, &event.tags);
            if let Some(payload) = Self::event_upsert_of(&event, Some(event_slug)) {
                let event_id = self
                    .store
                    .call(move |conn| store::upsert_event(conn, &payload))
                    .await?;
                report.event_id = Some(event_id);
                tracing::info!(
                    "Event saved: {event_slug} (id={event_id}, category={event_category:?})"
                );
            }
        }

        let mut markets = self.fetch_markets(Some(event_slug), false, None, false).await;
        report.markets_found = markets.len();
        if markets.is_empty() {
            report
                .warnings
                .push(format!("No markets found for event: {event_slug}"));
            return Ok(report);
        }

        for market in &mut markets {
            // Markets without their own category inherit the event's.
            if extract_category(&market.category, &market.tags).is_none() {
                market.category = event_category.clone();
            }
            let (id, warning) = self.process_market(market, report.event_id).await?;
            if id.is_some() {
                report.markets_saved += 1;
            }
            if let Some(w) = warning {
                report.warnings.push(w);
            }
        }
        Ok(report)
    }

    /// `discover_all`: paginate `/markets` and upsert every usable payload.
    pub async fn discover_all(
        &self,
        active_only: bool,
        limit: Option<usize>,
        fetch_all: bool,
    ) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let markets = self.fetch_markets(None, active_only, limit, fetch_all).await;
        report.markets_found = markets.len();
        tracing::info!("Found {} markets from Gamma API", markets.len());

        for market in &markets {
            let (id, warning) = self.process_market(market, None).await?;
            if id.is_some() {
                report.markets_saved += 1;
            }
            if let Some(w) = warning {
                report.warnings.push(w);
            }
        }
        Ok(report)
    }

    /// On-demand discovery when the indexer hits an unknown token id.
    /// Returns `None` (without mutating anything) when Gamma doesn't know the
    /// token either.
    pub async fn discover_by_token_id(&self, token_id: &str) -> Result<Option<MarketRef>> {
        let url = format!("{}/markets", self.cfg.gamma_api_base);
        let resp = self
            .http
            .get(&url)
            .query(&[("clob_token_ids", token_id)])
            .timeout(EVENT_TIMEOUT)
            .send()
            .await;
        let mut market = match resp {
            Ok(r) => match r.json::<Vec<GammaMarket>>().await {
                Ok(markets) => match markets.into_iter().next() {
                    Some(m) => m,
                    None => return Ok(None),
                },
                Err(e) => {
                    tracing::warn!("Failed to parse market by token_id from Gamma API: {e}");
                    return Ok(None);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to fetch market by token_id from Gamma API: {e}");
                return Ok(None);
            }
        };

        // Payload lacks a category: the full parent event usually has one in
        // its tags.
        if extract_category(&market.category, &market.tags).is_none() {
            let parent_slug = market.events.first().and_then(|e| e.slug.clone());
            if let Some(slug) = parent_slug {
                if let Some(full_event) = self.fetch_event(&slug).await {
                    market.category = extract_category(&full_event.category, &full_event.tags);
                }
            }
        }

        let (market_id, _warning) = self.process_market(&market, None).await?;
        let Some(market_id) = market_id else {
            return Ok(None);
        };

        let found = self
            .store
            .call(move |conn| {
                let market = conn.query_row(
                    "SELECT id, slug, condition_id, yes_token_id, no_token_id
                     FROM markets WHERE id = ?1",
                    rusqlite::params![market_id],
                    |row| {
                        Ok(MarketRef {
                            id: row.get(0)?,
                            slug: row.get(1)?,
                            condition_id: row.get(2)?,
                            yes_token_id: row.get(3)?,
                            no_token_id: row.get(4)?,
                        })
                    },
                )?;
                Ok(market)
            })
            .await?;
        Ok(Some(found))
    }

    /// Batch repair pass: pull all events, build slug → category, and fill
    /// markets that still lack one via their parent event.
    pub async fn update_categories_from_events(&self) -> Result<usize> {
        let url = format!("{}/events", self.cfg.gamma_api_base);
        let mut categories: Vec<(String, String)> = Vec::new();
        let mut offset = 0;
        loop {
            let resp = self
                .http
                .get(&url)
                .query(&[
                    ("limit", API_MAX_LIMIT.to_string()),
                    ("offset", offset.to_string()),
                ])
                .timeout(PAGE_TIMEOUT)
                .send()
                .await;
            let batch: Vec<GammaEvent> = match resp {
                Ok(r) => match r.json().await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("Failed to parse events from Gamma API: {e}");
                        break;
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to fetch events from Gamma API: {e}");
                    break;
                }
            };
            let batch_len = batch.len();
            for event in batch {
                if let (Some(slug), Some(category)) = (
                    event.slug.clone(),
                    extract_category(&event.category, &event.tags),
                ) {
                    categories.push((slug, category));
                }
            }
            if batch_len < API_MAX_LIMIT {
                break;
            }
            offset += API_MAX_LIMIT;
        }

        let updated = self
            .store
            .call(move |conn| {
                for (slug, category) in &categories {
                    conn.execute(
                        "UPDATE events SET category = ?1
                         WHERE slug = ?2 AND (category IS NULL OR category = '')",
                        rusqlite::params![category, slug],
                    )?;
                }
                let updated = conn.execute(
                    "UPDATE markets
                     SET category = (SELECT e.category FROM events e WHERE e.id = markets.event_id)
                     WHERE category IS NULL OR category = ''",
                    [],
                )?;
                Ok(updated)
            })
            .await?;
        tracing::info!("Updated {updated} markets with categories");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clob_token_ids_accept_both_encodings() {
        let as_string = Some(serde_json::json!("[\"123\", \"456\"]"));
        assert_eq!(
            parse_clob_token_ids(&as_string),
            (Some("123".into()), Some("456".into()))
        );

        let as_array = Some(serde_json::json!(["123", "456"]));
        assert_eq!(
            parse_clob_token_ids(&as_array),
            (Some("123".into()), Some("456".into()))
        );

        assert_eq!(parse_clob_token_ids(&None), (None, None));
        let short = Some(serde_json::json!(["only-one"]));
        assert_eq!(parse_clob_token_ids(&short), (None, None));
    }

    #[test]
    fn category_prefers_field_then_tags() {
        let tags = vec![
            serde_json::json!({"label": "All"}),
            serde_json::json!({"label": "Politics"}),
        ];
        assert_eq!(
            extract_category(&Some("Crypto".into()), &tags),
            Some("Crypto".into())
        );
        assert_eq!(extract_category(&None, &tags), Some("Politics".into()));
        assert_eq!(extract_category(&Some(String::new()), &[]), None);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_of(Some(true), Some(false), Some(false)), "active");
        assert_eq!(status_of(Some(true), Some(true), None), "closed");
        assert_eq!(status_of(Some(false), None, None), "closed");
        assert_eq!(status_of(Some(true), None, Some(true)), "archived");
        assert_eq!(status_of(None, None, None), "active");
    }

    #[test]
    fn verification_accepts_matching_derivation() {
        let cfg = Config::from_env();
        let condition = "0x0000000000000000000000000000000000000000000000000000000000000000";
        let derived = ctf::derive_token_ids(condition, &cfg.usdc_e).unwrap();
        let result = verify_token_ids(
            &cfg,
            condition,
            false,
            Some(&derived.yes_token_id),
            Some(&derived.no_token_id),
        );
        assert!(result.verified);
        assert!(result.warning.is_none());

        let mismatch = verify_token_ids(&cfg, condition, false, Some("1"), Some("2"));
        assert!(!mismatch.verified);
        assert!(mismatch.warning.unwrap().contains("mismatch"));

        let unverifiable = verify_token_ids(&cfg, condition, false, None, None);
        assert!(!unverifiable.verified);
        assert!(unverifiable.calculated_yes.is_some());
    }

    #[test]
    fn numeric_fields_normalize_across_spellings() {
        let market: GammaMarket = serde_json::from_value(serde_json::json!({
            "conditionId": "0xc0ffee",
            "volume": "1234.5",
            "volume24hr": 42.0,
            "liquidityNum": 10.0,
        }))
        .unwrap();
        assert_eq!(as_f64(&market.volume), Some(1234.5));
        assert_eq!(market.volume_24hr, Some(42.0));
        assert_eq!(market.liquidity_num, Some(10.0));
    }
}
