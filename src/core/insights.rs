//! Pre-aggregated market reports: hot markets, volume anomalies and
//! smart-money flow. These read the denormalized `markets` rollups and the
//! `whale_trades` materialization rather than rescanning `trades`.

use rusqlite::params;
use serde::Serialize;

use crate::core::db::store::Store;
use crate::core::metrics::cutoff_iso;
use crate::error::Result;

#[derive(Clone, Debug, Serialize)]
pub struct HotMarket {
    pub id: i64,
    pub slug: String,
    pub question: Option<String>,
    pub category: Option<String>,
    pub volume: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub trade_count: i64,
    pub unique_traders_24h: i64,
    pub outcome_prices: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VolumeAnomaly {
    pub id: i64,
    pub slug: String,
    pub question: Option<String>,
    pub volume: f64,
    pub volume_24h: f64,
    /// 24-hour volume against the 30-day daily average.
    pub anomaly_ratio: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SmartMoneyMarket {
    pub market_id: i64,
    pub slug: Option<String>,
    pub question: Option<String>,
    pub whale_buy_volume: f64,
    pub whale_sell_volume: f64,
    pub whale_trade_count: i64,
    pub net_flow: f64,
    pub flow_direction: String,
}

#[derive(Clone)]
pub struct Insights {
    store: Store,
}

impl Insights {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn hot_markets(&self, limit: usize) -> Result<Vec<HotMarket>> {
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, slug, question, category, volume, volume_24h, liquidity,
                            trade_count, unique_traders_24h, outcome_prices
                     FROM markets
                     WHERE status = 'active'
                     ORDER BY volume_24h DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| {
                        Ok(HotMarket {
                            id: row.get(0)?,
                            slug: row.get(1)?,
                            question: row.get(2)?,
                            category: row.get(3)?,
                            volume: row.get(4)?,
                            volume_24h: row.get(5)?,
                            liquidity: row.get(6)?,
                            trade_count: row.get(7)?,
                            unique_traders_24h: row.get(8)?,
                            outcome_prices: row.get(9)?,
                        })
                    })?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(rows)
            })
            .await
    }

    /// Markets whose 24 h volume is out of line with their 30-day average.
    /// A market with no history at all still flags when it suddenly does
    /// more than 5000 USD in a day (ratio pinned at 10).
    pub async fn volume_anomalies(&self, limit: usize) -> Result<Vec<VolumeAnomaly>> {
        let candidates: Vec<VolumeAnomaly> = self
            .store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, slug, question, volume, volume_24h
                     FROM markets
                     WHERE status = 'active' AND volume_24h > 0
                     ORDER BY volume_24h DESC
                     LIMIT 200",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(VolumeAnomaly {
                            id: row.get(0)?,
                            slug: row.get(1)?,
                            question: row.get(2)?,
                            volume: row.get(3)?,
                            volume_24h: row.get(4)?,
                            anomaly_ratio: 0.0,
                        })
                    })?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(rows)
            })
            .await?;

        let mut anomalies: Vec<VolumeAnomaly> = candidates
            .into_iter()
            .filter_map(|mut market| {
                let daily_avg = market.volume / 30.0;
                market.anomaly_ratio = if daily_avg > 0.0 {
                    market.volume_24h / daily_avg
                } else if market.volume_24h > 5000.0 {
                    10.0
                } else {
                    return None;
                };
                (market.anomaly_ratio >= 2.0).then_some(market)
            })
            .collect();

        anomalies.sort_by(|a, b| {
            b.anomaly_ratio
                .partial_cmp(&a.anomaly_ratio)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        anomalies.truncate(limit);
        Ok(anomalies)
    }

    pub async fn smart_money(&self, period_secs: i64, limit: usize) -> Result<Vec<SmartMoneyMarket>> {
        let cutoff = cutoff_iso(period_secs);
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT w.market_id, m.slug, m.question,
                            SUM(CASE WHEN w.side = 'BUY' THEN w.usd_value ELSE 0 END),
                            SUM(CASE WHEN w.side = 'SELL' THEN w.usd_value ELSE 0 END),
                            COUNT(*)
                     FROM whale_trades w
                     LEFT JOIN markets m ON w.market_id = m.id
                     WHERE w.timestamp >= ?1 AND w.market_id IS NOT NULL
                     GROUP BY w.market_id
                     ORDER BY SUM(w.usd_value) DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![cutoff, limit as i64], |row| {
                        let buys: f64 = row.get(3)?;
                        let sells: f64 = row.get(4)?;
                        let net = buys - sells;
                        Ok(SmartMoneyMarket {
                            market_id: row.get(0)?,
                            slug: row.get(1)?,
                            question: row.get(2)?,
                            whale_buy_volume: buys,
                            whale_sell_volume: sells,
                            whale_trade_count: row.get(5)?,
                            net_flow: net,
                            flow_direction: if net > 0.0 {
                                "inflow".into()
                            } else if net < 0.0 {
                                "outflow".into()
                            } else {
                                "neutral".into()
                            },
                        })
                    })?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::store::{MarketUpsert, upsert_market};

    fn market_with_volume(store: &Store, slug: &str, volume: f64, volume_24h: f64) -> i64 {
        store
            .with(|conn| {
                upsert_market(
                    conn,
                    &MarketUpsert {
                        slug: slug.into(),
                        condition_id: format!("0x{slug}"),
                        volume: Some(volume),
                        volume_24h: Some(volume_24h),
                        ..Default::default()
                    },
                )
            })
            .unwrap()
    }

    #[tokio::test]
    async fn anomaly_ratio_uses_thirty_day_average_with_fallback() {
        let store = Store::open_in_memory().unwrap();
        // 30000 over 30 days = 1000/day; 5000 today is a 5x anomaly.
        market_with_volume(&store, "spiky", 30_000.0, 5_000.0);
        // Steady market: ratio 1, filtered out.
        market_with_volume(&store, "steady", 30_000.0, 1_000.0);
        // No history but a large day: fallback ratio 10.
        market_with_volume(&store, "newborn", 0.0, 6_000.0);
        // No history, small day: not an anomaly.
        market_with_volume(&store, "quiet", 0.0, 100.0);

        let insights = Insights::new(store);
        let anomalies = insights.volume_anomalies(10).await.unwrap();
        let slugs: Vec<&str> = anomalies.iter().map(|a| a.slug.as_str()).collect();
        assert_eq!(slugs, vec!["newborn", "spiky"]);
        assert_eq!(anomalies[0].anomaly_ratio, 10.0);
        assert!((anomalies[1].anomaly_ratio - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hot_markets_rank_by_daily_volume() {
        let store = Store::open_in_memory().unwrap();
        market_with_volume(&store, "big", 100.0, 9_000.0);
        market_with_volume(&store, "small", 100.0, 10.0);

        let insights = Insights::new(store);
        let hot = insights.hot_markets(1).await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].slug, "big");
    }
}
