//! Typed access to the SQLite store.
//!
//! A `Store` wraps the single connection behind a mutex; async callers hop
//! onto the blocking pool via [`Store::call`] so the event loop never holds
//! the lock across a query. Row-level helpers are free functions over
//! `&Connection` so they compose inside transactions.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};

use crate::core::db::schema;
use crate::error::Result;

pub const TRADE_SYNC_KEY: &str = "trade_sync";
pub const WHALE_SYNC_KEY: &str = "whale_sync";

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::from_conn(schema::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_conn(schema::open_in_memory()?))
    }

    /// Deletes any existing database file and starts fresh.
    pub fn reset(path: &str) -> Result<Self> {
        Ok(Self::from_conn(schema::reset(path)?))
    }

    fn from_conn(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `f` against the connection on the current thread.
    pub fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        f(&mut conn)
    }

    /// Runs `f` on the blocking pool; use from async contexts.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with(f)).await?
    }
}

// ---------------------------------------------------------------------------
// Events and markets
// ---------------------------------------------------------------------------

/// Upsert payloads: `None` means "keep whatever is stored".
#[derive(Clone, Debug, Default)]
pub struct EventUpsert {
    pub slug: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub image: Option<String>,
    pub icon: Option<String>,
    pub status: Option<String>,
    pub enable_neg_risk: Option<bool>,
}

pub fn upsert_event(conn: &Connection, event: &EventUpsert) -> Result<i64> {
    let id = conn.query_row(
        "INSERT INTO events
            (slug, title, description, category, start_date, end_date, image, icon, status, enable_neg_risk)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, COALESCE(?9, 'active'), COALESCE(?10, 0))
         ON CONFLICT(slug) DO UPDATE SET
            title = COALESCE(excluded.title, title),
            description = COALESCE(excluded.description, description),
            category = COALESCE(excluded.category, category),
            start_date = COALESCE(excluded.start_date, start_date),
            end_date = COALESCE(excluded.end_date, end_date),
            image = COALESCE(excluded.image, image),
            icon = COALESCE(excluded.icon, icon),
            status = COALESCE(?9, status),
            enable_neg_risk = COALESCE(?10, enable_neg_risk),
            updated_at = datetime('now')
         RETURNING id",
        params![
            event.slug,
            event.title,
            event.description,
            event.category,
            event.start_date,
            event.end_date,
            event.image,
            event.icon,
            event.status,
            event.enable_neg_risk,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

#[derive(Clone, Debug, Default)]
pub struct MarketUpsert {
    pub event_id: Option<i64>,
    pub slug: String,
    pub condition_id: String,
    pub question_id: Option<String>,
    pub oracle: Option<String>,
    pub collateral_token: Option<String>,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
    pub enable_neg_risk: Option<bool>,
    pub status: Option<String>,
    pub question: Option<String>,
    pub description: Option<String>,
    pub outcomes: Option<String>,
    pub outcome_prices: Option<String>,
    pub end_date: Option<String>,
    pub image: Option<String>,
    pub icon: Option<String>,
    pub category: Option<String>,
    pub volume: Option<f64>,
    pub volume_24h: Option<f64>,
    pub liquidity: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub sync_warning: Option<String>,
}

pub fn upsert_market(conn: &Connection, market: &MarketUpsert) -> Result<i64> {
    let id = conn.query_row(
        "INSERT INTO markets
            (event_id, slug, condition_id, question_id, oracle, collateral_token,
             yes_token_id, no_token_id, enable_neg_risk, status, question, description,
             outcomes, outcome_prices, end_date, image, icon, category,
             volume, volume_24h, liquidity, best_bid, best_ask, sync_warning)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, COALESCE(?9, 0), COALESCE(?10, 'active'),
                 ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                 COALESCE(?19, 0), COALESCE(?20, 0), COALESCE(?21, 0), ?22, ?23, ?24)
         ON CONFLICT(condition_id) DO UPDATE SET
            event_id = COALESCE(excluded.event_id, event_id),
            slug = excluded.slug,
            question_id = COALESCE(excluded.question_id, question_id),
            oracle = COALESCE(excluded.oracle, oracle),
            collateral_token = COALESCE(excluded.collateral_token, collateral_token),
            yes_token_id = COALESCE(excluded.yes_token_id, yes_token_id),
            no_token_id = COALESCE(excluded.no_token_id, no_token_id),
            enable_neg_risk = COALESCE(?9, enable_neg_risk),
            status = COALESCE(?10, status),
            question = COALESCE(excluded.question, question),
            description = COALESCE(excluded.description, description),
            outcomes = COALESCE(excluded.outcomes, outcomes),
            outcome_prices = COALESCE(excluded.outcome_prices, outcome_prices),
            end_date = COALESCE(excluded.end_date, end_date),
            image = COALESCE(excluded.image, image),
            icon = COALESCE(excluded.icon, icon),
            category = COALESCE(excluded.category, category),
            volume = COALESCE(?19, volume),
            volume_24h = COALESCE(?20, volume_24h),
            liquidity = COALESCE(?21, liquidity),
            best_bid = COALESCE(excluded.best_bid, best_bid),
            best_ask = COALESCE(excluded.best_ask, best_ask),
            sync_warning = COALESCE(excluded.sync_warning, sync_warning),
            updated_at = datetime('now')
         RETURNING id",
        params![
            market.event_id,
            market.slug,
            market.condition_id,
            market.question_id,
            market.oracle,
            market.collateral_token,
            market.yes_token_id,
            market.no_token_id,
            market.enable_neg_risk,
            market.status,
            market.question,
            market.description,
            market.outcomes,
            market.outcome_prices,
            market.end_date,
            market.image,
            market.icon,
            market.category,
            market.volume,
            market.volume_24h,
            market.liquidity,
            market.best_bid,
            market.best_ask,
            market.sync_warning,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// The subset of a market row the indexer needs to classify a trade.
#[derive(Clone, Debug)]
pub struct MarketRef {
    pub id: i64,
    pub slug: String,
    pub condition_id: String,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
}

pub fn market_by_token_id(conn: &Connection, token_id: &str) -> Result<Option<MarketRef>> {
    let market = conn
        .query_row(
            "SELECT id, slug, condition_id, yes_token_id, no_token_id
             FROM markets
             WHERE yes_token_id = ?1 OR no_token_id = ?1
             LIMIT 1",
            params![token_id],
            |row| {
                Ok(MarketRef {
                    id: row.get(0)?,
                    slug: row.get(1)?,
                    condition_id: row.get(2)?,
                    yes_token_id: row.get(3)?,
                    no_token_id: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(market)
}

/// Yes-token default used by the kline/metrics endpoints.
pub fn market_yes_token(conn: &Connection, market_id: i64) -> Result<Option<Option<String>>> {
    let found = conn
        .query_row(
            "SELECT yes_token_id FROM markets WHERE id = ?1",
            params![market_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(found)
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct NewTrade {
    pub market_id: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub maker: String,
    pub taker: String,
    pub side: String,
    pub outcome: String,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub token_id: String,
    pub timestamp: String,
}

/// Inserts one trade; duplicate `(tx_hash, log_index)` is silently ignored.
/// Returns the new row id when a row was actually written and keeps the
/// `markets.trade_count` rollup in step.
pub fn insert_trade(conn: &Connection, trade: &NewTrade) -> Result<Option<i64>> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO trades
            (market_id, tx_hash, log_index, block_number, maker, taker,
             side, outcome, price, size, fee, token_id, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            trade.market_id,
            trade.tx_hash,
            trade.log_index,
            trade.block_number,
            trade.maker,
            trade.taker,
            trade.side,
            trade.outcome,
            trade.price,
            trade.size,
            trade.fee,
            trade.token_id,
            trade.timestamp,
        ],
    )?;
    if inserted == 0 {
        return Ok(None);
    }
    let id = conn.last_insert_rowid();
    conn.execute(
        "UPDATE markets SET trade_count = trade_count + 1 WHERE id = ?1",
        params![trade.market_id],
    )?;
    Ok(Some(id))
}

/// Commits one block's trades together with the `trade_sync` cursor advance
/// in a single transaction. This is the crash-safety contract: a resume from
/// `trade_sync + 1` can only replay blocks whose commit never landed, and
/// replays are absorbed by the `(tx_hash, log_index)` unique key.
pub fn commit_block(
    conn: &mut Connection,
    block_number: u64,
    trades: &[NewTrade],
) -> Result<Vec<(i64, NewTrade)>> {
    let tx = conn.transaction()?;
    let mut inserted = Vec::new();
    for trade in trades {
        if let Some(id) = insert_trade(&tx, trade)? {
            inserted.push((id, trade.clone()));
        }
    }
    set_sync_state(&tx, TRADE_SYNC_KEY, block_number as i64)?;
    tx.commit()?;
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Sync cursors
// ---------------------------------------------------------------------------

pub fn get_sync_state(conn: &Connection, key: &str) -> Result<Option<i64>> {
    let value = conn
        .query_row(
            "SELECT last_block FROM sync_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_sync_state(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (key, last_block, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            last_block = excluded.last_block,
            updated_at = datetime('now')",
        params![key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduler support
// ---------------------------------------------------------------------------

/// Most-voluminous active markets, for the metadata refresh pass.
pub fn markets_for_refresh(
    conn: &Connection,
    limit: usize,
) -> Result<Vec<(i64, String, Option<i64>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, slug, event_id FROM markets
         WHERE status = 'active' AND slug IS NOT NULL
         ORDER BY volume DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(rows)
}

pub fn apply_market_refresh(
    conn: &Connection,
    market_id: i64,
    outcome_prices: Option<&str>,
    status: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE markets
         SET outcome_prices = COALESCE(?2, outcome_prices),
             status = ?3,
             updated_at = datetime('now')
         WHERE id = ?1",
        params![market_id, outcome_prices, status],
    )?;
    Ok(())
}

pub fn update_event_slug(conn: &Connection, event_id: i64, slug: &str) -> Result<()> {
    conn.execute(
        "UPDATE events SET slug = ?2, updated_at = datetime('now') WHERE id = ?1",
        params![event_id, slug],
    )?;
    Ok(())
}

/// Refreshes `unique_traders_24h` (distinct takers in a sliding 24 h window)
/// for the top markets by 24 h volume. Eventually consistent by design.
pub fn update_unique_traders(conn: &Connection, limit: usize, cutoff_iso: &str) -> Result<usize> {
    let market_ids: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM markets
             WHERE status = 'active'
             ORDER BY volume_24h DESC
             LIMIT ?1",
        )?;
        stmt.query_map(params![limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?
    };
    if market_ids.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["?"; market_ids.len()].join(",");
    let mut stmt = conn.prepare(&format!(
        "SELECT market_id, COUNT(DISTINCT taker)
         FROM trades
         WHERE market_id IN ({placeholders})
           AND timestamp >= ?
         GROUP BY market_id"
    ))?;
    let mut bindings: Vec<&dyn rusqlite::ToSql> = market_ids
        .iter()
        .map(|id| id as &dyn rusqlite::ToSql)
        .collect();
    bindings.push(&cutoff_iso as &dyn rusqlite::ToSql);

    let counts: Vec<(i64, i64)> = stmt
        .query_map(&bindings[..], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut updated = 0;
    for (market_id, traders) in counts {
        conn.execute(
            "UPDATE markets SET unique_traders_24h = ?2 WHERE id = ?1",
            params![market_id, traders],
        )?;
        updated += 1;
    }
    Ok(updated)
}

pub fn table_count(conn: &Connection, table: &str) -> Result<i64> {
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_market(conn: &Connection) -> i64 {
        upsert_market(
            conn,
            &MarketUpsert {
                slug: "will-it-rain".into(),
                condition_id: "0xc0ffee".into(),
                question: Some("Will it rain?".into()),
                yes_token_id: Some("111".into()),
                no_token_id: Some("222".into()),
                category: Some("Weather".into()),
                volume: Some(1000.0),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn test_trade(market_id: i64, log_index: i64, price: f64, size: f64) -> NewTrade {
        NewTrade {
            market_id,
            tx_hash: "0xabc".into(),
            log_index,
            block_number: 105,
            maker: "0xmaker".into(),
            taker: "0xtaker".into(),
            side: "BUY".into(),
            outcome: "YES".into(),
            price,
            size,
            fee: 0.0,
            token_id: "111".into(),
            timestamp: "2025-06-01T12:00:00Z".into(),
        }
    }

    #[test]
    fn market_upsert_is_a_fixed_point() {
        let store = Store::open_in_memory().unwrap();
        store
            .with(|conn| {
                let id = test_market(conn);
                // Second upsert with nulls must keep every stored field.
                let again = upsert_market(
                    conn,
                    &MarketUpsert {
                        slug: "will-it-rain".into(),
                        condition_id: "0xc0ffee".into(),
                        ..Default::default()
                    },
                )?;
                assert_eq!(id, again);
                let (question, category, volume): (String, String, f64) = conn.query_row(
                    "SELECT question, category, volume FROM markets WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                assert_eq!(question, "Will it rain?");
                assert_eq!(category, "Weather");
                assert_eq!(volume, 1000.0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn duplicate_trades_are_ignored_and_trade_count_tracks_inserts() {
        let store = Store::open_in_memory().unwrap();
        store
            .with(|conn| {
                let market_id = test_market(conn);
                let trade = test_trade(market_id, 7, 0.5, 100.0);
                assert!(insert_trade(conn, &trade)?.is_some());
                assert!(insert_trade(conn, &trade)?.is_none());

                let count: i64 = conn.query_row(
                    "SELECT trade_count FROM markets WHERE id = ?1",
                    params![market_id],
                    |row| row.get(0),
                )?;
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn commit_block_bundles_trades_with_cursor() {
        let store = Store::open_in_memory().unwrap();
        store
            .with(|conn| {
                let market_id = test_market(conn);
                let trades = vec![
                    test_trade(market_id, 1, 0.4, 100.0),
                    test_trade(market_id, 2, 0.6, 50.0),
                ];
                let inserted = commit_block(conn, 105, &trades)?;
                assert_eq!(inserted.len(), 2);
                assert_eq!(get_sync_state(conn, TRADE_SYNC_KEY)?, Some(105));

                // Re-running the same block is idempotent.
                let replay = commit_block(conn, 105, &trades)?;
                assert!(replay.is_empty());
                assert_eq!(table_count(conn, "trades")?, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn sync_state_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store
            .with(|conn| {
                assert_eq!(get_sync_state(conn, WHALE_SYNC_KEY)?, None);
                set_sync_state(conn, WHALE_SYNC_KEY, 42)?;
                set_sync_state(conn, WHALE_SYNC_KEY, 43)?;
                assert_eq!(get_sync_state(conn, WHALE_SYNC_KEY)?, Some(43));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn token_lookup_finds_either_side() {
        let store = Store::open_in_memory().unwrap();
        store
            .with(|conn| {
                test_market(conn);
                assert!(market_by_token_id(conn, "111")?.is_some());
                let no_side = market_by_token_id(conn, "222")?.unwrap();
                assert_eq!(no_side.no_token_id.as_deref(), Some("222"));
                assert!(market_by_token_id(conn, "999")?.is_none());
                Ok(())
            })
            .unwrap();
    }
}
