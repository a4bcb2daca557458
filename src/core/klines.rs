//! OHLCV candles computed on demand from the trades table.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::core::db::store::Store;
use crate::error::Result;

pub fn interval_seconds(interval: &str) -> Option<i64> {
    match interval {
        "1m" => Some(60),
        "5m" => Some(300),
        "15m" => Some(900),
        "1h" => Some(3600),
        "4h" => Some(14400),
        "1d" => Some(86400),
        _ => None,
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Kline {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: i64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PriceRange {
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub volume: f64,
    pub trade_count: i64,
}

#[derive(Clone)]
pub struct KlineAggregator {
    store: Store,
}

impl KlineAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// The most recent `limit` buckets, in ascending time order. `open` is
    /// the earliest trade of the bucket and `close` the latest, tie-broken by
    /// row id so re-runs are stable.
    pub async fn klines(
        &self,
        market_id: i64,
        interval_secs: i64,
        limit: usize,
        token_id: Option<String>,
    ) -> Result<Vec<Kline>> {
        self.store
            .call(move |conn| {
                let token_filter = if token_id.is_some() {
                    "AND token_id = ?4"
                } else {
                    ""
                };
                let sql = format!(
                    "WITH trade_periods AS (
                        SELECT id, price, size, timestamp,
                               (CAST(strftime('%s', replace(timestamp, 'Z', '+00:00')) AS INTEGER) / ?2) * ?2 AS period
                        FROM trades
                        WHERE market_id = ?1 AND price > 0 {token_filter}
                    ),
                    period_stats AS (
                        SELECT period,
                               MIN(price) AS low,
                               MAX(price) AS high,
                               SUM(price * size) AS volume,
                               COUNT(*) AS trade_count,
                               MIN(timestamp) AS first_ts,
                               MAX(timestamp) AS last_ts
                        FROM trade_periods
                        GROUP BY period
                    )
                    SELECT ps.period,
                           (SELECT tp.price FROM trade_periods tp
                            WHERE tp.period = ps.period AND tp.timestamp = ps.first_ts
                            ORDER BY tp.id ASC LIMIT 1) AS open,
                           ps.high,
                           ps.low,
                           (SELECT tp.price FROM trade_periods tp
                            WHERE tp.period = ps.period AND tp.timestamp = ps.last_ts
                            ORDER BY tp.id DESC LIMIT 1) AS close,
                           ps.volume,
                           ps.trade_count
                    FROM period_stats ps
                    ORDER BY ps.period DESC
                    LIMIT ?3"
                );

                let mut stmt = conn.prepare(&sql)?;
                let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Kline> {
                    Ok(Kline {
                        timestamp: row.get(0)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                        trade_count: row.get(6)?,
                    })
                };
                let mut klines: Vec<Kline> = if let Some(token) = token_id {
                    stmt.query_map(
                        params![market_id, interval_secs, limit as i64, token],
                        map_row,
                    )?
                    .collect::<rusqlite::Result<_>>()?
                } else {
                    stmt.query_map(params![market_id, interval_secs, limit as i64], map_row)?
                        .collect::<rusqlite::Result<_>>()?
                };
                klines.reverse();
                Ok(klines)
            })
            .await
    }

    /// Latest traded price (with its timestamp).
    pub async fn latest_price(
        &self,
        market_id: i64,
        token_id: Option<String>,
    ) -> Result<Option<(f64, String)>> {
        self.store
            .call(move |conn| {
                let row = match token_id {
                    Some(token) => conn
                        .query_row(
                            "SELECT price, timestamp FROM trades
                             WHERE market_id = ?1 AND token_id = ?2 AND price > 0
                             ORDER BY timestamp DESC, id DESC
                             LIMIT 1",
                            params![market_id, token],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?,
                    None => conn
                        .query_row(
                            "SELECT price, timestamp FROM trades
                             WHERE market_id = ?1 AND price > 0
                             ORDER BY timestamp DESC, id DESC
                             LIMIT 1",
                            params![market_id],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?,
                };
                Ok(row)
            })
            .await
    }

    /// High/low/open/close/volume over the trailing `hours` window.
    pub async fn price_range(
        &self,
        market_id: i64,
        token_id: Option<String>,
        hours: i64,
    ) -> Result<PriceRange> {
        let cutoff = crate::core::metrics::cutoff_iso(hours * 3600);
        self.store
            .call(move |conn| {
                let token_filter = if token_id.is_some() {
                    "AND token_id = ?3"
                } else {
                    ""
                };
                let base = format!(
                    "FROM trades WHERE market_id = ?1 AND price > 0 AND timestamp >= ?2 {token_filter}"
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

                let (low, high, volume, trade_count): (Option<f64>, Option<f64>, Option<f64>, i64) =
                    run!(
                        &format!(
                            "SELECT MIN(price), MAX(price), SUM(price * size), COUNT(*) {base}"
                        ),
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    )?;

                let open: Option<f64> = run!(
                    &format!("SELECT price {base} ORDER BY timestamp ASC, id ASC LIMIT 1"),
                    |row| row.get(0)
                )
                .optional()?;
                let close: Option<f64> = run!(
                    &format!("SELECT price {base} ORDER BY timestamp DESC, id DESC LIMIT 1"),
                    |row| row.get(0)
                )
                .optional()?;

                Ok(PriceRange {
                    high,
                    low,
                    open,
                    close,
                    volume: volume.unwrap_or(0.0),
                    trade_count,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::store::{MarketUpsert, NewTrade, insert_trade, upsert_market};

    fn trade(market_id: i64, idx: i64, price: f64, size: f64, timestamp: &str) -> NewTrade {
        NewTrade {
            market_id,
            tx_hash: format!("0xk{idx}"),
            log_index: idx,
            block_number: idx,
            maker: "0xm".into(),
            taker: "0xt".into(),
            side: "BUY".into(),
            outcome: "YES".into(),
            price,
            size,
            fee: 0.0,
            token_id: "111".into(),
            timestamp: timestamp.into(),
        }
    }

    fn seeded() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let market_id = store
            .with(|conn| {
                let id = upsert_market(
                    conn,
                    &MarketUpsert {
                        slug: "kline-market".into(),
                        condition_id: "0xk1".into(),
                        yes_token_id: Some("111".into()),
                        ..Default::default()
                    },
                )?;
                // Two trades in the 12:00 hour bucket, one in the 13:00 bucket.
                insert_trade(conn, &trade(id, 1, 0.40, 100.0, "2025-06-01T12:05:00Z"))?;
                insert_trade(conn, &trade(id, 2, 0.60, 50.0, "2025-06-01T12:45:00Z"))?;
                insert_trade(conn, &trade(id, 3, 0.55, 10.0, "2025-06-01T13:10:00Z"))?;
                Ok(id)
            })
            .unwrap();
        (store, market_id)
    }

    #[tokio::test]
    async fn hourly_buckets_aggregate_ohlcv() {
        let (store, market_id) = seeded();
        let aggregator = KlineAggregator::new(store);
        let klines = aggregator
            .klines(market_id, 3600, 100, Some("111".into()))
            .await
            .unwrap();
        assert_eq!(klines.len(), 2);

        // Ascending time order.
        assert!(klines[0].timestamp < klines[1].timestamp);

        let first = &klines[0];
        assert_eq!(first.open, 0.40);
        assert_eq!(first.close, 0.60);
        assert_eq!(first.high, 0.60);
        assert_eq!(first.low, 0.40);
        assert!((first.volume - (0.40 * 100.0 + 0.60 * 50.0)).abs() < 1e-9);
        assert_eq!(first.trade_count, 2);
        // Bucket start is aligned to the hour.
        assert_eq!(first.timestamp % 3600, 0);

        let second = &klines[1];
        assert_eq!(second.open, 0.55);
        assert_eq!(second.trade_count, 1);
    }

    #[tokio::test]
    async fn limit_returns_most_recent_buckets() {
        let (store, market_id) = seeded();
        let aggregator = KlineAggregator::new(store);
        let klines = aggregator
            .klines(market_id, 3600, 1, None)
            .await
            .unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].open, 0.55);
    }

    #[tokio::test]
    async fn latest_price_breaks_timestamp_ties_by_id() {
        let (store, market_id) = seeded();
        let aggregator = KlineAggregator::new(store);
        let (price, ts) = aggregator
            .latest_price(market_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(price, 0.55);
        assert_eq!(ts, "2025-06-01T13:10:00Z");
    }
}
