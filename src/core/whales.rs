//! Whale detection over the canonical trade store.
//!
//! Backfill mode re-derives `whale_trades` from all of `trades`; tail mode
//! follows the monotonic trade id via the `whale_sync` cursor and returns the
//! new qualifiers for broadcasting. The threshold is read per call, so later
//! threshold changes never rewrite history.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::core::db::store::{self, Store};
use crate::error::Result;

#[derive(Clone, Debug, Serialize)]
pub struct WhaleTrade {
    pub id: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub market_id: Option<i64>,
    pub market_slug: Option<String>,
    pub question: Option<String>,
    pub trader: Option<String>,
    pub side: Option<String>,
    pub outcome: Option<String>,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub usd_value: Option<f64>,
    pub block_number: Option<i64>,
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WhaleStats {
    pub total_count: i64,
    pub total_volume: f64,
    pub avg_value: f64,
    pub max_value: f64,
    pub min_value: f64,
}

fn whale_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WhaleTrade> {
    Ok(WhaleTrade {
        id: row.get(0)?,
        tx_hash: row.get(1)?,
        log_index: row.get(2)?,
        market_id: row.get(3)?,
        trader: row.get(4)?,
        side: row.get(5)?,
        outcome: row.get(6)?,
        price: row.get(7)?,
        size: row.get(8)?,
        usd_value: row.get(9)?,
        block_number: row.get(10)?,
        timestamp: row.get(11)?,
        market_slug: row.get(12)?,
        question: row.get(13)?,
    })
}

#[derive(Clone)]
pub struct WhaleDetector {
    store: Store,
    threshold: f64,
}

impl WhaleDetector {
    pub fn new(store: Store, threshold: f64) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Backfill: materialize every historical qualifier. Idempotent.
    pub async fn backfill(&self) -> Result<usize> {
        let threshold = self.threshold;
        self.store
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO whale_trades
                        (tx_hash, log_index, market_id, trader, side, outcome,
                         price, size, usd_value, block_number, timestamp)
                     SELECT tx_hash, log_index, market_id, maker, side, outcome,
                            price, size, price * size, block_number, timestamp
                     FROM trades
                     WHERE price * size > ?1",
                    params![threshold],
                )?;
                Ok(inserted)
            })
            .await
    }

    /// Tail: qualifiers past the `whale_sync` cursor, persisted and returned
    /// (with market slug/question joined in) for fan-out.
    pub async fn detect_new(&self) -> Result<Vec<WhaleTrade>> {
        let threshold = self.threshold;
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let since = store::get_sync_state(&tx, store::WHALE_SYNC_KEY)?.unwrap_or(0);

                let new_whales: Vec<WhaleTrade> = {
                    let mut stmt = tx.prepare(
                        "SELECT t.id, t.tx_hash, t.log_index, t.market_id, t.maker, t.side,
                                t.outcome, t.price, t.size, t.price * t.size, t.block_number,
                                t.timestamp, m.slug, m.question
                         FROM trades t
                         LEFT JOIN markets m ON t.market_id = m.id
                         WHERE t.id > ?1 AND t.price * t.size > ?2
                         ORDER BY t.id ASC",
                    )?;
                    stmt.query_map(params![since, threshold], |row| whale_from_row(row))?
                        .collect::<rusqlite::Result<_>>()?
                };

                for whale in &new_whales {
                    tx.execute(
                        "INSERT OR IGNORE INTO whale_trades
                            (tx_hash, log_index, market_id, trader, side, outcome,
                             price, size, usd_value, block_number, timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        params![
                            whale.tx_hash,
                            whale.log_index,
                            whale.market_id,
                            whale.trader,
                            whale.side,
                            whale.outcome,
                            whale.price,
                            whale.size,
                            whale.usd_value,
                            whale.block_number,
                            whale.timestamp,
                        ],
                    )?;
                }

                if let Some(max_id) = new_whales.iter().map(|w| w.id).max() {
                    store::set_sync_state(&tx, store::WHALE_SYNC_KEY, max_id)?;
                }
                tx.commit()?;
                Ok(new_whales)
            })
            .await
    }

    /// Largest whales first, optionally bounded by usd value and market.
    pub async fn list(
        &self,
        limit: usize,
        min_usd: Option<f64>,
        market_id: Option<i64>,
    ) -> Result<Vec<WhaleTrade>> {
        let min_value = min_usd.unwrap_or(self.threshold);
        self.store
            .call(move |conn| {
                let (sql, bind_market) = match market_id {
                    Some(_) => (
                        "SELECT w.id, w.tx_hash, w.log_index, w.market_id, w.trader, w.side,
                                w.outcome, w.price, w.size, w.usd_value, w.block_number,
                                w.timestamp, m.slug, m.question
                         FROM whale_trades w
                         LEFT JOIN markets m ON w.market_id = m.id
                         WHERE w.usd_value >= ?1 AND w.market_id = ?3
                         ORDER BY w.usd_value DESC
                         LIMIT ?2",
                        true,
                    ),
                    None => (
                        "SELECT w.id, w.tx_hash, w.log_index, w.market_id, w.trader, w.side,
                                w.outcome, w.price, w.size, w.usd_value, w.block_number,
                                w.timestamp, m.slug, m.question
                         FROM whale_trades w
                         LEFT JOIN markets m ON w.market_id = m.id
                         WHERE w.usd_value >= ?1
                         ORDER BY w.usd_value DESC
                         LIMIT ?2",
                        false,
                    ),
                };
                let mut stmt = conn.prepare(sql)?;
                let rows = if bind_market {
                    stmt.query_map(
                        params![min_value, limit as i64, market_id],
                        |row| whale_from_row(row),
                    )?
                    .collect::<rusqlite::Result<_>>()?
                } else {
                    stmt.query_map(params![min_value, limit as i64], |row| whale_from_row(row))?
                        .collect::<rusqlite::Result<_>>()?
                };
                Ok(rows)
            })
            .await
    }

    /// Most recent whales by trade timestamp.
    pub async fn recent(&self, limit: usize) -> Result<Vec<WhaleTrade>> {
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT w.id, w.tx_hash, w.log_index, w.market_id, w.trader, w.side,
                            w.outcome, w.price, w.size, w.usd_value, w.block_number,
                            w.timestamp, m.slug, m.question
                     FROM whale_trades w
                     LEFT JOIN markets m ON w.market_id = m.id
                     ORDER BY w.timestamp DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| whale_from_row(row))?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn stats(&self, min_usd: Option<f64>, market_id: Option<i64>) -> Result<WhaleStats> {
        self.store
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT COUNT(*), COALESCE(SUM(usd_value), 0), COALESCE(AVG(usd_value), 0),
                            COALESCE(MAX(usd_value), 0), COALESCE(MIN(usd_value), 0)
                     FROM whale_trades",
                );
                let mut clauses = Vec::new();
                let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(min) = min_usd {
                    clauses.push(format!("usd_value >= ?{}", bindings.len() + 1));
                    bindings.push(Box::new(min));
                }
                if let Some(market) = market_id {
                    clauses.push(format!("market_id = ?{}", bindings.len() + 1));
                    bindings.push(Box::new(market));
                }
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                let refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
                let stats = conn
                    .query_row(&sql, &refs[..], |row| {
                        Ok(WhaleStats {
                            total_count: row.get(0)?,
                            total_volume: row.get(1)?,
                            avg_value: row.get(2)?,
                            max_value: row.get(3)?,
                            min_value: row.get(4)?,
                        })
                    })
                    .optional()?
                    .unwrap_or_default();
                Ok(stats)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::store::{MarketUpsert, NewTrade, insert_trade, upsert_market};

    async fn seeded_store(values: &[f64]) -> Store {
        let store = Store::open_in_memory().unwrap();
        let values = values.to_vec();
        store
            .with(|conn| {
                let market_id = upsert_market(
                    conn,
                    &MarketUpsert {
                        slug: "whale-market".into(),
                        condition_id: "0xbeef".into(),
                        question: Some("Will whales swim?".into()),
                        yes_token_id: Some("111".into()),
                        ..Default::default()
                    },
                )?;
                for (i, usd) in values.iter().enumerate() {
                    insert_trade(
                        conn,
                        &NewTrade {
                            market_id,
                            tx_hash: format!("0xtx{i}"),
                            log_index: i as i64,
                            block_number: 100 + i as i64,
                            maker: format!("0xmaker{i}"),
                            taker: format!("0xtaker{i}"),
                            side: if i % 2 == 0 { "BUY" } else { "SELL" }.into(),
                            outcome: "YES".into(),
                            price: 0.5,
                            size: usd / 0.5,
                            fee: 0.0,
                            token_id: "111".into(),
                            timestamp: format!("2025-06-01T12:00:0{i}Z"),
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn tail_emits_each_qualifier_exactly_once() {
        let store = seeded_store(&[500.0, 1500.0, 1500.0, 800.0, 2000.0]).await;
        let detector = WhaleDetector::new(store.clone(), 1000.0);

        let first = detector.detect_new().await.unwrap();
        let ids: Vec<i64> = first.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![2, 3, 5]);
        assert_eq!(first[0].question.as_deref(), Some("Will whales swim?"));

        let second = detector.detect_new().await.unwrap();
        assert!(second.is_empty());

        let cursor = store
            .with(|conn| store::get_sync_state(conn, store::WHALE_SYNC_KEY))
            .unwrap();
        assert_eq!(cursor, Some(5));
    }

    #[tokio::test]
    async fn backfill_is_idempotent() {
        let store = seeded_store(&[500.0, 1500.0, 2000.0]).await;
        let detector = WhaleDetector::new(store, 1000.0);
        assert_eq!(detector.backfill().await.unwrap(), 2);
        assert_eq!(detector.backfill().await.unwrap(), 0);

        let stats = detector.stats(None, None).await.unwrap();
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.max_value, 2000.0);
    }

    #[tokio::test]
    async fn list_orders_by_usd_value() {
        let store = seeded_store(&[1200.0, 3000.0, 1800.0]).await;
        let detector = WhaleDetector::new(store, 1000.0);
        detector.backfill().await.unwrap();

        let whales = detector.list(10, None, None).await.unwrap();
        let values: Vec<f64> = whales.iter().filter_map(|w| w.usd_value).collect();
        assert_eq!(values, vec![3000.0, 1800.0, 1200.0]);

        let floor = detector.list(10, Some(2000.0), None).await.unwrap();
        assert_eq!(floor.len(), 1);
    }
}
