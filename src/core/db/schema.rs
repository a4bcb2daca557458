//! SQLite schema, migrations and reset.
//!
//! WAL mode so API readers proceed while the scheduler writes. Migration is
//! forward-only and additive: new columns are added when missing, legacy
//! snapshot tables are dropped, and the `trade_count` rollup is repaired from
//! the authoritative `trades` table.

use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Opens (or creates) the database, applies pragmas and the full schema.
pub fn open(path: &str) -> Result<Connection> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    init(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    Ok(conn)
}

/// Deletes the database file (plus WAL sidecars) and recreates the schema.
pub fn reset(path: &str) -> Result<Connection> {
    for suffix in ["", "-wal", "-shm"] {
        let file = format!("{path}{suffix}");
        if Path::new(&file).exists() {
            let _ = std::fs::remove_file(&file);
        }
    }
    open(path)
}

fn init(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -64000)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            slug            VARCHAR NOT NULL UNIQUE,
            title           VARCHAR,
            description     TEXT,
            category        VARCHAR,
            start_date      VARCHAR,
            end_date        VARCHAR,
            image           VARCHAR,
            icon            VARCHAR,
            status          VARCHAR DEFAULT 'active',
            enable_neg_risk BOOLEAN DEFAULT 0,
            created_at      TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at      TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS markets (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id         INTEGER,
            slug             VARCHAR NOT NULL,
            condition_id     VARCHAR NOT NULL UNIQUE,
            question_id      VARCHAR,
            oracle           VARCHAR,
            collateral_token VARCHAR,
            yes_token_id     VARCHAR,
            no_token_id      VARCHAR,
            enable_neg_risk  BOOLEAN DEFAULT 0,
            status           VARCHAR DEFAULT 'active',
            question         VARCHAR,
            description      TEXT,
            outcomes         VARCHAR,
            outcome_prices   VARCHAR,
            end_date         VARCHAR,
            image            VARCHAR,
            icon             VARCHAR,
            category         VARCHAR,
            volume           REAL DEFAULT 0,
            volume_24h       REAL DEFAULT 0,
            liquidity        REAL DEFAULT 0,
            best_bid         REAL,
            best_ask         REAL,
            trade_count      INTEGER DEFAULT 0,
            unique_traders_24h INTEGER DEFAULT 0,
            sync_warning     VARCHAR,
            created_at       TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at       TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (event_id) REFERENCES events(id)
        );

        CREATE INDEX IF NOT EXISTS idx_markets_slug ON markets(slug);
        CREATE INDEX IF NOT EXISTS idx_markets_yes_token ON markets(yes_token_id);
        CREATE INDEX IF NOT EXISTS idx_markets_no_token ON markets(no_token_id);
        CREATE INDEX IF NOT EXISTS idx_markets_event_id ON markets(event_id);
        CREATE INDEX IF NOT EXISTS idx_markets_category ON markets(category);
        CREATE INDEX IF NOT EXISTS idx_markets_volume ON markets(volume DESC);
        CREATE INDEX IF NOT EXISTS idx_markets_status ON markets(status);

        CREATE TABLE IF NOT EXISTS trades (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            market_id    INTEGER,
            tx_hash      VARCHAR NOT NULL,
            log_index    INTEGER NOT NULL,
            block_number INTEGER,
            maker        VARCHAR,
            taker        VARCHAR,
            side         VARCHAR,
            outcome      VARCHAR,
            price        DECIMAL(18, 8),
            size         DECIMAL(18, 8),
            fee          DECIMAL(18, 8),
            token_id     VARCHAR,
            timestamp    TIMESTAMP,
            created_at   TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (market_id) REFERENCES markets(id),
            UNIQUE (tx_hash, log_index)
        );

        CREATE INDEX IF NOT EXISTS idx_trades_market_id ON trades(market_id);
        CREATE INDEX IF NOT EXISTS idx_trades_block ON trades(block_number);
        CREATE INDEX IF NOT EXISTS idx_trades_token_id ON trades(token_id);
        CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);
        CREATE INDEX IF NOT EXISTS idx_trades_maker ON trades(maker);
        CREATE INDEX IF NOT EXISTS idx_trades_taker ON trades(taker);

        CREATE TABLE IF NOT EXISTS whale_trades (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_hash      VARCHAR NOT NULL,
            log_index    INTEGER NOT NULL,
            market_id    INTEGER,
            trader       VARCHAR,
            side         VARCHAR,
            outcome      VARCHAR,
            price        REAL,
            size         REAL,
            usd_value    REAL,
            block_number INTEGER,
            timestamp    TIMESTAMP,
            created_at   TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (market_id) REFERENCES markets(id),
            UNIQUE (tx_hash, log_index)
        );

        CREATE INDEX IF NOT EXISTS idx_whales_usd ON whale_trades(usd_value DESC);
        CREATE INDEX IF NOT EXISTS idx_whales_market ON whale_trades(market_id);
        CREATE INDEX IF NOT EXISTS idx_whales_timestamp ON whale_trades(timestamp);
        CREATE INDEX IF NOT EXISTS idx_whales_trader ON whale_trades(trader);

        CREATE TABLE IF NOT EXISTS sync_state (
            key        VARCHAR PRIMARY KEY,
            last_block INTEGER,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    migrate(conn)?;
    Ok(())
}

/// Additive migration: idempotent column introduction plus rollup repair.
pub fn migrate(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "events", "category", "VARCHAR")?;

    for (name, decl) in [
        ("image", "VARCHAR"),
        ("icon", "VARCHAR"),
        ("category", "VARCHAR"),
        ("volume", "REAL DEFAULT 0"),
        ("volume_24h", "REAL DEFAULT 0"),
        ("liquidity", "REAL DEFAULT 0"),
        ("best_bid", "REAL"),
        ("best_ask", "REAL"),
        ("trade_count", "INTEGER DEFAULT 0"),
        ("unique_traders_24h", "INTEGER DEFAULT 0"),
    ] {
        add_column_if_missing(conn, "markets", name, decl)?;
    }

    // K-lines and metric snapshots are computed on the fly from trades now.
    conn.execute_batch(
        "DROP TABLE IF EXISTS klines;
         DROP TABLE IF EXISTS market_metrics;",
    )?;

    // Repair the trade_count rollup from the authoritative trades table.
    conn.execute(
        "UPDATE markets
         SET trade_count = (SELECT COUNT(*) FROM trades WHERE trades.market_id = markets.id)
         WHERE EXISTS (SELECT 1 FROM trades WHERE trades.market_id = markets.id)",
        [],
    )?;

    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"),
            [],
        )?;
        tracing::info!("migration: added column {table}.{column}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_and_migrates_idempotently() {
        let conn = open_in_memory().unwrap();
        // Running the migration again must be a no-op.
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM markets", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn unique_constraints_are_enforced() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO trades (tx_hash, log_index) VALUES ('0xaa', 1)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO trades (tx_hash, log_index) VALUES ('0xaa', 1)",
            [],
        );
        assert!(dup.is_err());
    }
}
