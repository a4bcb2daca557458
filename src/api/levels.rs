//! Whale-level classification for wallet addresses.
//!
//! Levels come from an address's Data-API trade history: the largest single
//! trade and the largest per-market volume decide the tier. Results sit in a
//! process-local TTL cache because the upstream fetch is expensive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, Semaphore};

use super::types::DataApiTrade;
use crate::config::Config;

const LEVEL_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
const LEVEL_CONCURRENCY: usize = 6;

pub type LevelCache = Arc<RwLock<HashMap<String, (Instant, Option<String>)>>>;

pub fn new_cache() -> LevelCache {
    Arc::new(RwLock::new(HashMap::new()))
}

pub fn is_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Tier thresholds over (max single trade, max single-market volume).
pub fn calc_whale_level(max_trade: f64, max_market: f64) -> &'static str {
    if max_trade >= 10_000.0 && max_market >= 50_000.0 {
        "whale"
    } else if max_trade >= 5_000.0 && max_market >= 10_000.0 {
        "shark"
    } else if (500.0..5_000.0).contains(&max_trade) || (2_000.0..10_000.0).contains(&max_market) {
        "dolphin"
    } else {
        "fish"
    }
}

/// Classifies one address, consulting the TTL cache first. Returns `None`
/// for invalid addresses or addresses with no trade history.
pub async fn compute_whale_level(
    http: &reqwest::Client,
    cfg: &Config,
    cache: &LevelCache,
    address: &str,
) -> Option<String> {
    if !is_address(address) {
        return None;
    }
    let normalized = address.to_lowercase();
    let ttl = Duration::from_secs(cfg.trader_level_cache_ttl_secs);

    {
        let cached = cache.read().await;
        if let Some((stamp, level)) = cached.get(&normalized) {
            if stamp.elapsed() < ttl {
                return level.clone();
            }
        }
    }

    let trades = fetch_level_trades(http, cfg, &normalized).await;
    let level = if trades.is_empty() {
        None
    } else {
        let mut max_trade = 0.0f64;
        let mut market_totals: HashMap<String, f64> = HashMap::new();
        for trade in &trades {
            let usd = trade.usd();
            max_trade = max_trade.max(usd);
            if let Some(condition_id) = &trade.condition_id {
                *market_totals.entry(condition_id.clone()).or_insert(0.0) += usd;
            }
        }
        let max_market = market_totals.values().copied().fold(0.0f64, f64::max);
        Some(calc_whale_level(max_trade, max_market).to_string())
    };

    cache
        .write()
        .await
        .insert(normalized, (Instant::now(), level.clone()));
    level
}

async fn fetch_level_trades(
    http: &reqwest::Client,
    cfg: &Config,
    address: &str,
) -> Vec<DataApiTrade> {
    let limit = cfg.trader_level_max_trades.min(10_000);
    let resp = http
        .get(format!("{}/trades", cfg.data_api_base))
        .query(&[
            ("user", address),
            ("takerOnly", "false"),
            ("limit", &limit.to_string()),
            ("offset", "0"),
        ])
        .timeout(LEVEL_FETCH_TIMEOUT)
        .send()
        .await;
    match resp {
        Ok(r) => r.json().await.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("whale level fetch failed for {address}: {e}");
            Vec::new()
        }
    }
}

/// Classifies a batch of addresses with bounded concurrency.
pub async fn compute_levels_for(
    http: &reqwest::Client,
    cfg: &Arc<Config>,
    cache: &LevelCache,
    addresses: &[String],
) -> HashMap<String, Option<String>> {
    let semaphore = Arc::new(Semaphore::new(LEVEL_CONCURRENCY));
    let mut handles = Vec::new();
    for address in addresses {
        let http = http.clone();
        let cfg = cfg.clone();
        let cache = cache.clone();
        let address = address.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.ok()?;
            let level = compute_whale_level(&http, &cfg, &cache, &address).await;
            Some((address, level))
        }));
    }

    let mut levels = HashMap::new();
    for handle in handles {
        if let Ok(Some((address, level))) = handle.await {
            levels.insert(address, level);
        }
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_the_threshold_table() {
        assert_eq!(calc_whale_level(10_000.0, 50_000.0), "whale");
        assert_eq!(calc_whale_level(12_000.0, 40_000.0), "shark");
        assert_eq!(calc_whale_level(5_000.0, 10_000.0), "shark");
        assert_eq!(calc_whale_level(600.0, 0.0), "dolphin");
        assert_eq!(calc_whale_level(0.0, 2_500.0), "dolphin");
        assert_eq!(calc_whale_level(100.0, 100.0), "fish");
        assert_eq!(calc_whale_level(0.0, 0.0), "fish");
    }

    #[test]
    fn address_validation() {
        assert!(is_address("0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E"));
        assert!(!is_address("0x1234"));
        assert!(!is_address("4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982Eff"));
        assert!(!is_address("0xZZZb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E"));
    }
}
