//! Typed records for external collaborator payloads.
//!
//! The Data API mixes numbers and numeric strings for the same field across
//! endpoints, so numeric fields deserialize through lenient helpers. Unknown
//! fields are ignored everywhere.

use serde::{Deserialize, Deserializer, Serialize};

pub fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

pub fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// One trade from the Data API `/trades` endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataApiTrade {
    pub proxy_wallet: Option<String>,
    pub side: Option<String>,
    pub asset: Option<String>,
    pub condition_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub timestamp: Option<i64>,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub icon: Option<String>,
    pub event_slug: Option<String>,
    pub outcome: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub outcome_index: Option<i64>,
    pub name: Option<String>,
    pub pseudonym: Option<String>,
    pub bio: Option<String>,
    pub profile_image: Option<String>,
    pub profile_image_optimized: Option<String>,
    pub transaction_hash: Option<String>,
    /// Enrichment: `price * size`, attached by this service.
    #[serde(skip_deserializing)]
    pub usd_value: Option<f64>,
}

impl DataApiTrade {
    pub fn usd(&self) -> f64 {
        self.price.unwrap_or(0.0) * self.size.unwrap_or(0.0)
    }
}

/// One position from the Data API `/positions` / `/closed-positions`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataApiPosition {
    pub proxy_wallet: Option<String>,
    pub asset: Option<String>,
    pub condition_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub avg_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub initial_value: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub current_value: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub cash_pnl: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub percent_pnl: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub total_bought: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub realized_pnl: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub percent_realized_pnl: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub cur_price: Option<f64>,
    pub redeemable: Option<bool>,
    pub mergeable: Option<bool>,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub icon: Option<String>,
    pub event_slug: Option<String>,
    pub outcome: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub outcome_index: Option<i64>,
    pub opposite_outcome: Option<String>,
    pub opposite_asset: Option<String>,
    pub end_date: Option<String>,
    pub negative_risk: Option<bool>,
}

/// One leaderboard row from `/v1/leaderboard`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: Option<String>,
    pub proxy_wallet: Option<String>,
    pub user_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub vol: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub pnl: Option<f64>,
    pub profile_image: Option<String>,
    pub x_username: Option<String>,
    pub verified_badge: Option<bool>,
    /// Enrichment: whale level classification, attached by this service.
    #[serde(skip_deserializing)]
    pub whale_level: Option<String>,
}

/// A holder row from the Data API `/holders` endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Holder {
    pub proxy_wallet: Option<String>,
    pub pseudonym: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub outcome_index: Option<i64>,
    pub profile_image: Option<String>,
    pub name: Option<String>,
    pub display_username_public: Option<bool>,
    #[serde(skip_deserializing)]
    pub whale_level: Option<String>,
}

/// A Gamma `/public-profile` payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub display_username_public: Option<bool>,
    pub name: Option<String>,
    pub pseudonym: Option<String>,
    pub bio: Option<String>,
    pub profile_image: Option<String>,
    pub x_username: Option<String>,
    pub verified_badge: Option<bool>,
    pub proxy_wallet: Option<String>,
}

/// One activity item from the Data API `/activity` endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityItem {
    pub side: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub usdc_size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_numbers_accept_strings_and_numbers() {
        let trade: DataApiTrade = serde_json::from_value(serde_json::json!({
            "proxyWallet": "0xabc",
            "price": "0.42",
            "size": 100,
            "timestamp": "1735334310",
            "unknownField": true,
        }))
        .unwrap();
        assert_eq!(trade.price, Some(0.42));
        assert_eq!(trade.size, Some(100.0));
        assert_eq!(trade.timestamp, Some(1735334310));
        assert!((trade.usd() - 42.0).abs() < 1e-9);
    }
}
