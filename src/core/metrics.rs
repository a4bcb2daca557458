//! Market signal computations: buy/sell pressure, VWAP, whale signal,
//! trader cardinality and net flow. Everything is an on-demand scan over
//! `trades` with `market_id = ? AND price > 0` plus the window cutoff.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::core::db::store::Store;
use crate::error::Result;

/// Fixed period mapping shared by the metrics endpoints.
pub fn period_seconds(period: &str) -> Option<i64> {
    match period {
        "1h" => Some(3600),
        "4h" => Some(14400),
        "24h" => Some(86400),
        "7d" => Some(604800),
        "30d" => Some(2592000),
        _ => None,
    }
}

/// ISO cutoff `now - seconds`, matching the stored trade timestamp format so
/// the comparison is a plain string compare.
pub fn cutoff_iso(seconds: i64) -> String {
    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(seconds);
    cutoff.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BuySellPressure {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_count: i64,
    pub sell_count: i64,
    /// `buy_volume / sell_volume`; null when both sides are zero and null
    /// when sells alone are zero (the +inf case).
    pub buy_sell_ratio: Option<f64>,
    pub buy_percentage: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct VwapReport {
    pub vwap: Option<f64>,
    pub current_price: Option<f64>,
    pub price_vs_vwap: Option<f64>,
    pub total_volume: f64,
    pub total_size: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct WhaleSignal {
    pub signal: String,
    pub whale_buy_volume: f64,
    pub whale_sell_volume: f64,
    pub whale_buy_count: i64,
    pub whale_sell_count: i64,
    pub whale_ratio: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TraderStats {
    pub unique_traders: i64,
    pub total_trades: i64,
    pub avg_trade_size: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct NetFlow {
    pub net_flow: f64,
    pub flow_direction: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsBundle {
    #[serde(flatten)]
    pub pressure: BuySellPressure,
    pub vwap: Option<f64>,
    pub current_price: Option<f64>,
    pub price_vs_vwap: Option<f64>,
    pub total_volume: f64,
    pub whale_signal: String,
    pub whale_buy_volume: f64,
    pub whale_sell_volume: f64,
    pub whale_ratio: Option<f64>,
    pub unique_traders: i64,
    pub total_trades: i64,
    pub avg_trade_size: f64,
    pub net_flow: f64,
    pub flow_direction: String,
}

#[derive(Clone)]
pub struct MarketMetrics {
    store: Store,
    whale_threshold: f64,
}

impl MarketMetrics {
    pub fn new(store: Store, whale_threshold: f64) -> Self {
        Self {
            store,
            whale_threshold,
        }
    }

    async fn side_totals(
        &self,
        market_id: i64,
        token_id: Option<String>,
        period_secs: i64,
        min_usd: Option<f64>,
    ) -> Result<(f64, f64, i64, i64)> {
        let cutoff = cutoff_iso(period_secs);
        self.store
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT side, SUM(price * size), COUNT(*)
                     FROM trades
                     WHERE market_id = ?1 AND timestamp >= ?2 AND price > 0",
                );
                let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(market_id), Box::new(cutoff)];
                if let Some(token) = token_id {
                    sql.push_str(&format!(" AND token_id = ?{}", bindings.len() + 1));
                    bindings.push(Box::new(token));
                }
                if let Some(min) = min_usd {
                    sql.push_str(&format!(" AND price * size >= ?{}", bindings.len() + 1));
                    bindings.push(Box::new(min));
                }
                sql.push_str(" GROUP BY side");

                let refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows: Vec<(Option<String>, f64, i64)> = stmt
                    .query_map(&refs[..], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<rusqlite::Result<_>>()?;

                let mut totals = (0.0, 0.0, 0, 0);
                for (side, volume, count) in rows {
                    match side.as_deref() {
                        Some(s) if s.eq_ignore_ascii_case("BUY") => {
                            totals.0 = volume;
                            totals.2 = count;
                        }
                        Some(s) if s.eq_ignore_ascii_case("SELL") => {
                            totals.1 = volume;
                            totals.3 = count;
                        }
                        _ => {}
                    }
                }
                Ok(totals)
            })
            .await
    }

    pub async fn buy_sell_pressure(
        &self,
        market_id: i64,
        token_id: Option<String>,
        period_secs: i64,
    ) -> Result<BuySellPressure> {
        let (buy_volume, sell_volume, buy_count, sell_count) = self
            .side_totals(market_id, token_id, period_secs, None)
            .await?;

        let total = buy_volume + sell_volume;
        let ratio = if sell_volume > 0.0 {
            Some(round_to(buy_volume / sell_volume, 2))
        } else {
            // Zero sells: null, whether that's the +inf case or no flow at all.
            None
        };
        let buy_percentage = if total > 0.0 {
            round_to(buy_volume / total * 100.0, 1)
        } else {
            50.0
        };

        Ok(BuySellPressure {
            buy_volume: round_to(buy_volume, 2),
            sell_volume: round_to(sell_volume, 2),
            buy_count,
            sell_count,
            buy_sell_ratio: ratio,
            buy_percentage,
        })
    }

    pub async fn vwap(
        &self,
        market_id: i64,
        token_id: Option<String>,
        period_secs: i64,
    ) -> Result<VwapReport> {
        let cutoff = cutoff_iso(period_secs);
        self.store
            .call(move |conn| {
                let token_filter = if token_id.is_some() {
                    "AND token_id = ?3"
                } else {
                    ""
                };
                let where_sql = format!(
                    "WHERE market_id = ?1 AND timestamp >= ?2 AND price > 0 AND size > 0 {token_filter}"
                );

                macro_rules! run {
                    ($sql:expr, $map:expr) => {
                        if let Some(token) = &token_id {
                            conn.query_row($sql, params![market_id, cutoff, token], $map)
                        } else {
                            conn.query_row($sql, params![market_id, cutoff], $map)
                        }
                    };
                }

                let (total_value, total_size): (Option<f64>, Option<f64>) = run!(
                    &format!("SELECT SUM(price * size), SUM(size) FROM trades {where_sql}"),
                    |row| Ok((row.get(0)?, row.get(1)?))
                )?;
                let total_value = total_value.unwrap_or(0.0);
                let total_size = total_size.unwrap_or(0.0);

                let current_price: Option<f64> = run!(
                    &format!(
                        "SELECT price FROM trades {where_sql}
                         ORDER BY timestamp DESC, id DESC LIMIT 1"
                    ),
                    |row| row.get(0)
                )
                .optional()?;

                let vwap = if total_size > 0.0 {
                    Some(total_value / total_size)
                } else {
                    None
                };
                let price_vs_vwap = match (vwap, current_price) {
                    (Some(v), Some(p)) if v > 0.0 => Some(round_to((p - v) / v * 100.0, 2)),
                    _ => None,
                };

                Ok(VwapReport {
                    vwap: vwap.map(|v| round_to(v, 4)),
                    current_price: current_price.map(|p| round_to(p, 4)),
                    price_vs_vwap,
                    total_volume: round_to(total_value, 2),
                    total_size: round_to(total_size, 2),
                })
            })
            .await
    }

    /// Net whale imbalance over the window: bullish above 60% buys, bearish
    /// below 40%, else neutral.
    pub async fn whale_signal(
        &self,
        market_id: i64,
        token_id: Option<String>,
        period_secs: i64,
        threshold: Option<f64>,
    ) -> Result<WhaleSignal> {
        let threshold = threshold.unwrap_or(self.whale_threshold);
        let (buy_volume, sell_volume, buy_count, sell_count) = self
            .side_totals(market_id, token_id, period_secs, Some(threshold))
            .await?;

        let total = buy_volume + sell_volume;
        let (signal, ratio) = if total == 0.0 {
            ("neutral", Some(1.0))
        } else {
            let buy_share = buy_volume / total;
            let signal = if buy_share > 0.6 {
                "bullish"
            } else if buy_share < 0.4 {
                "bearish"
            } else {
                "neutral"
            };
            let ratio = if sell_volume > 0.0 {
                Some(round_to(buy_volume / sell_volume, 2))
            } else {
                None
            };
            (signal, ratio)
        };

        Ok(WhaleSignal {
            signal: signal.into(),
            whale_buy_volume: round_to(buy_volume, 2),
            whale_sell_volume: round_to(sell_volume, 2),
            whale_buy_count: buy_count,
            whale_sell_count: sell_count,
            whale_ratio: ratio,
        })
    }

    /// Trader cardinality over the window. `unique_traders` is
    /// `max(distinct makers, distinct takers)` — a deliberate approximation
    /// of the union, preserved for parity with the historical reports.
    pub async fn trader_stats(
        &self,
        market_id: i64,
        token_id: Option<String>,
        period_secs: i64,
    ) -> Result<TraderStats> {
        let cutoff = cutoff_iso(period_secs);
        self.store
            .call(move |conn| {
                let token_filter = if token_id.is_some() {
                    "AND token_id = ?3"
                } else {
                    ""
                };
                let sql = format!(
                    "SELECT COUNT(DISTINCT maker), COUNT(DISTINCT taker), COUNT(*),
                            COALESCE(AVG(price * size), 0)
                     FROM trades
                     WHERE market_id = ?1 AND timestamp >= ?2 {token_filter}"
                );
                let (makers, takers, total_trades, avg_size): (i64, i64, i64, f64) =
                    if let Some(token) = &token_id {
                        conn.query_row(&sql, params![market_id, cutoff, token], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                        })?
                    } else {
                        conn.query_row(&sql, params![market_id, cutoff], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                        })?
                    };
                Ok(TraderStats {
                    unique_traders: makers.max(takers),
                    total_trades,
                    avg_trade_size: round_to(avg_size, 2),
                })
            })
            .await
    }

    pub async fn net_flow(
        &self,
        market_id: i64,
        token_id: Option<String>,
        period_secs: i64,
    ) -> Result<NetFlow> {
        let pressure = self
            .buy_sell_pressure(market_id, token_id, period_secs)
            .await?;
        let net = pressure.buy_volume - pressure.sell_volume;
        let direction = if net > 0.0 {
            "inflow"
        } else if net < 0.0 {
            "outflow"
        } else {
            "neutral"
        };
        Ok(NetFlow {
            net_flow: round_to(net, 2),
            flow_direction: direction.into(),
        })
    }

    pub async fn all_metrics(
        &self,
        market_id: i64,
        token_id: Option<String>,
        period_secs: i64,
    ) -> Result<MetricsBundle> {
        let pressure = self
            .buy_sell_pressure(market_id, token_id.clone(), period_secs)
            .await?;
        let vwap = self.vwap(market_id, token_id.clone(), period_secs).await?;
        let whale = self
            .whale_signal(market_id, token_id.clone(), period_secs, None)
            .await?;
        let traders = self
            .trader_stats(market_id, token_id.clone(), period_secs)
            .await?;
        let flow = self.net_flow(market_id, token_id, period_secs).await?;

        Ok(MetricsBundle {
            vwap: vwap.vwap,
            current_price: vwap.current_price,
            price_vs_vwap: vwap.price_vs_vwap,
            total_volume: vwap.total_volume,
            whale_signal: whale.signal,
            whale_buy_volume: whale.whale_buy_volume,
            whale_sell_volume: whale.whale_sell_volume,
            whale_ratio: whale.whale_ratio,
            unique_traders: traders.unique_traders,
            total_trades: traders.total_trades,
            avg_trade_size: traders.avg_trade_size,
            net_flow: flow.net_flow,
            flow_direction: flow.flow_direction,
            pressure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::store::{MarketUpsert, NewTrade, insert_trade, upsert_market};
    use chrono::SecondsFormat;

    fn recent_iso(secs_ago: i64) -> String {
        (chrono::Utc::now() - chrono::Duration::seconds(secs_ago))
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn trade(
        market_id: i64,
        idx: i64,
        side: &str,
        price: f64,
        size: f64,
        secs_ago: i64,
    ) -> NewTrade {
        NewTrade {
            market_id,
            tx_hash: format!("0xmx{idx}"),
            log_index: idx,
            block_number: idx,
            maker: format!("0xmaker{idx}"),
            taker: format!("0xtaker{}", idx % 2),
            side: side.into(),
            outcome: "YES".into(),
            price,
            size,
            fee: 0.0,
            token_id: "111".into(),
            timestamp: recent_iso(secs_ago),
        }
    }

    fn market(store: &Store) -> i64 {
        store
            .with(|conn| {
                upsert_market(
                    conn,
                    &MarketUpsert {
                        slug: "metric-market".into(),
                        condition_id: "0xmm".into(),
                        yes_token_id: Some("111".into()),
                        ..Default::default()
                    },
                )
            })
            .unwrap()
    }

    #[tokio::test]
    async fn vwap_weights_by_size() {
        let store = Store::open_in_memory().unwrap();
        let market_id = market(&store);
        store
            .with(|conn| {
                insert_trade(conn, &trade(market_id, 1, "BUY", 0.40, 100.0, 300))?;
                insert_trade(conn, &trade(market_id, 2, "BUY", 0.60, 50.0, 200))?;
                insert_trade(conn, &trade(market_id, 3, "SELL", 0.50, 50.0, 100))?;
                Ok(())
            })
            .unwrap();

        let metrics = MarketMetrics::new(store, 1000.0);
        let report = metrics.vwap(market_id, None, 3600).await.unwrap();
        assert_eq!(report.vwap, Some(0.475));
        assert_eq!(report.current_price, Some(0.50));
        assert_eq!(report.price_vs_vwap, Some(5.26));
        assert_eq!(report.total_size, 200.0);
    }

    #[tokio::test]
    async fn ratio_is_null_when_sells_are_zero() {
        let store = Store::open_in_memory().unwrap();
        let market_id = market(&store);
        store
            .with(|conn| insert_trade(conn, &trade(market_id, 1, "BUY", 0.5, 100.0, 60)).map(|_| ()))
            .unwrap();

        let metrics = MarketMetrics::new(store, 1000.0);
        let pressure = metrics
            .buy_sell_pressure(market_id, None, 3600)
            .await
            .unwrap();
        assert_eq!(pressure.buy_sell_ratio, None);
        assert_eq!(pressure.buy_percentage, 100.0);
        assert_eq!(pressure.sell_count, 0);
    }

    #[tokio::test]
    async fn ratio_is_null_when_both_sides_are_zero() {
        let store = Store::open_in_memory().unwrap();
        let market_id = market(&store);

        let metrics = MarketMetrics::new(store, 1000.0);
        let pressure = metrics
            .buy_sell_pressure(market_id, None, 3600)
            .await
            .unwrap();
        assert_eq!(pressure.buy_sell_ratio, None);
        assert_eq!(pressure.buy_percentage, 50.0);
        assert_eq!(pressure.buy_volume, 0.0);
        assert_eq!(pressure.sell_volume, 0.0);
    }

    #[tokio::test]
    async fn hour_window_excludes_older_trades() {
        let store = Store::open_in_memory().unwrap();
        let market_id = market(&store);
        store
            .with(|conn| {
                insert_trade(conn, &trade(market_id, 1, "BUY", 0.5, 100.0, 120))?;
                // Strictly older than one hour: outside the window.
                insert_trade(conn, &trade(market_id, 2, "BUY", 0.5, 100.0, 3700))?;
                Ok(())
            })
            .unwrap();

        let metrics = MarketMetrics::new(store, 1000.0);
        let pressure = metrics
            .buy_sell_pressure(market_id, None, 3600)
            .await
            .unwrap();
        assert_eq!(pressure.buy_count, 1);
    }

    #[tokio::test]
    async fn whale_signal_classifies_imbalance() {
        let store = Store::open_in_memory().unwrap();
        let market_id = market(&store);
        store
            .with(|conn| {
                // 3000 USD of whale buys vs 1000 of whale sells; a 200 USD
                // minnow buy stays below the threshold.
                insert_trade(conn, &trade(market_id, 1, "BUY", 0.5, 6000.0, 300))?;
                insert_trade(conn, &trade(market_id, 2, "SELL", 0.5, 2000.0, 200))?;
                insert_trade(conn, &trade(market_id, 3, "BUY", 0.5, 400.0, 100))?;
                Ok(())
            })
            .unwrap();

        let metrics = MarketMetrics::new(store, 1000.0);
        let signal = metrics
            .whale_signal(market_id, None, 86400, None)
            .await
            .unwrap();
        assert_eq!(signal.signal, "bullish");
        assert_eq!(signal.whale_buy_volume, 3000.0);
        assert_eq!(signal.whale_sell_volume, 1000.0);
        assert_eq!(signal.whale_buy_count, 1);
        assert_eq!(signal.whale_ratio, Some(3.0));
    }

    #[tokio::test]
    async fn trader_stats_use_the_larger_distinct_side() {
        let store = Store::open_in_memory().unwrap();
        let market_id = market(&store);
        store
            .with(|conn| {
                // Three distinct makers, two distinct takers.
                for i in 0..3 {
                    insert_trade(conn, &trade(market_id, i, "BUY", 0.5, 10.0, 100 + i))?;
                }
                Ok(())
            })
            .unwrap();

        let metrics = MarketMetrics::new(store, 1000.0);
        let stats = metrics.trader_stats(market_id, None, 3600).await.unwrap();
        assert_eq!(stats.unique_traders, 3);
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.avg_trade_size, 5.0);
    }

    #[tokio::test]
    async fn net_flow_signs_direction() {
        let store = Store::open_in_memory().unwrap();
        let market_id = market(&store);
        store
            .with(|conn| {
                insert_trade(conn, &trade(market_id, 1, "BUY", 0.5, 100.0, 100))?;
                insert_trade(conn, &trade(market_id, 2, "SELL", 0.5, 300.0, 90))?;
                Ok(())
            })
            .unwrap();

        let metrics = MarketMetrics::new(store, 1000.0);
        let flow = metrics.net_flow(market_id, None, 3600).await.unwrap();
        assert_eq!(flow.net_flow, -100.0);
        assert_eq!(flow.flow_direction, "outflow");
    }
}
