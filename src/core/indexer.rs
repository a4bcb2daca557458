//! OrderFilled log scanner.
//!
//! Walks `[from_block, to_block]` in batches, decodes exchange fills into
//! canonical trades and commits each block's trades together with the
//! `trade_sync` cursor in one transaction. Resuming from `trade_sync + 1`
//! after a crash therefore replays at most the blocks whose commit never
//! landed, and replays are idempotent via the `(tx_hash, log_index)` key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::B256;
use alloy_sol_types::{SolEvent, sol};
use chrono::SecondsFormat;
use serde::Serialize;

use crate::config::Config;
use crate::core::db::store::{self, NewTrade, Store};
use crate::core::discovery::Discovery;
use crate::core::rpc::{LogEntry, RpcClient};
use crate::error::{Error, Result};

pub const DEFAULT_BATCH_SIZE: u64 = 500;

sol! {
    event OrderFilled(
        bytes32 indexed orderHash,
        address indexed maker,
        address indexed taker,
        uint256 makerAssetId,
        uint256 takerAssetId,
        uint256 makerAmountFilled,
        uint256 takerAmountFilled,
        uint256 fee
    );
}

pub fn order_filled_topic() -> String {
    format!("0x{}", hex::encode(OrderFilled::SIGNATURE_HASH))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// One decoded OrderFilled leg, still in raw integer units.
#[derive(Clone, Debug)]
pub struct DecodedFill {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub maker: String,
    pub taker: String,
    pub side: Side,
    pub token_id: String,
    pub usdc_raw: u128,
    pub token_raw: u128,
    pub fee_raw: u128,
}

impl DecodedFill {
    /// Integer-exact ratio; zero token amount yields price 0 (the trade is
    /// kept, metrics filter on `price > 0`).
    pub fn price(&self) -> f64 {
        if self.token_raw > 0 {
            self.usdc_raw as f64 / self.token_raw as f64
        } else {
            0.0
        }
    }

    pub fn size(&self) -> f64 {
        self.token_raw as f64 / 1e6
    }

    pub fn fee(&self) -> f64 {
        self.fee_raw as f64 / 1e6
    }
}

/// Decodes one raw log. The maker leg being collateral (`makerAssetId == 0`)
/// marks a BUY of `takerAssetId`; otherwise the maker sold `makerAssetId`.
pub fn decode_order_filled(log: &LogEntry) -> Option<DecodedFill> {
    let topics: Vec<B256> = log
        .topics
        .iter()
        .filter_map(|t| t.parse::<B256>().ok())
        .collect();
    if topics.len() < 4 {
        return None;
    }
    let data = hex::decode(log.data.trim_start_matches("0x")).ok()?;
    let decoded = OrderFilled::decode_raw_log(topics.iter().copied(), &data).ok()?;

    let (side, token_id, usdc_raw, token_raw) = if decoded.makerAssetId.is_zero() {
        (
            Side::Buy,
            decoded.takerAssetId,
            decoded.makerAmountFilled,
            decoded.takerAmountFilled,
        )
    } else {
        (
            Side::Sell,
            decoded.makerAssetId,
            decoded.takerAmountFilled,
            decoded.makerAmountFilled,
        )
    };

    Some(DecodedFill {
        tx_hash: log.transaction_hash.clone(),
        log_index: log.log_index_u64(),
        block_number: log.block_number_u64(),
        maker: format!("{:?}", decoded.maker),
        taker: format!("{:?}", decoded.taker),
        side,
        token_id: token_id.to_string(),
        usdc_raw: usdc_raw.try_into().ok()?,
        token_raw: token_raw.try_into().ok()?,
        fee_raw: decoded.fee.try_into().ok()?,
    })
}

pub fn iso_utc(epoch_secs: u64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs as i64, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Summary of a newly persisted trade, for fan-out on the `trades` channel.
#[derive(Clone, Debug, Serialize)]
pub struct InsertedTrade {
    pub id: i64,
    pub market_id: i64,
    pub tx_hash: String,
    pub side: String,
    pub outcome: String,
    pub price: f64,
    pub size: f64,
    pub usd_value: f64,
    pub token_id: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IndexerReport {
    pub from_block: u64,
    pub to_block: u64,
    pub total_logs: usize,
    pub inserted_trades: usize,
    pub skipped_trades: usize,
    pub unknown_tokens: usize,
    pub discovered_markets: usize,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub new_trades: Vec<InsertedTrade>,
}

#[derive(Clone, Debug, Default)]
pub struct IndexOptions {
    pub batch_size: u64,
    /// When set, only logs from this transaction are persisted; block
    /// iteration (and the checkpoint) still advances over the full range.
    pub tx_hash: Option<String>,
}

#[derive(Clone)]
pub struct Indexer {
    rpc: RpcClient,
    store: Store,
    discovery: Discovery,
    cfg: Arc<Config>,
}

impl Indexer {
    pub fn new(rpc: RpcClient, store: Store, discovery: Discovery, cfg: Arc<Config>) -> Self {
        Self {
            rpc,
            store,
            discovery,
            cfg,
        }
    }

    /// Incremental sync from the persisted cursor up to `to_block`
    /// (defaulting to the chain head).
    pub async fn sync_trades(
        &self,
        to_block: Option<u64>,
        batch_size: u64,
    ) -> Result<IndexerReport> {
        let last = self
            .store
            .call(|conn| store::get_sync_state(conn, store::TRADE_SYNC_KEY))
            .await?
            .ok_or_else(|| {
                Error::InvalidInput(
                    "no previous sync state; run the indexer with an explicit from-block first"
                        .into(),
                )
            })?;
        let from_block = (last + 1) as u64;
        let to_block = match to_block {
            Some(b) => b,
            None => self.rpc.block_number().await?,
        };

        if from_block > to_block {
            tracing::debug!("already synced to block {last}");
            return Ok(IndexerReport {
                from_block,
                to_block,
                ..Default::default()
            });
        }

        tracing::info!("Syncing trades from block {from_block} to {to_block}...");
        self.run(
            from_block,
            to_block,
            IndexOptions {
                batch_size,
                tx_hash: None,
            },
        )
        .await
    }

    pub async fn run(
        &self,
        from_block: u64,
        to_block: u64,
        opts: IndexOptions,
    ) -> Result<IndexerReport> {
        let batch_size = opts.batch_size.max(1);
        let tx_filter = opts.tx_hash.map(|h| {
            let h = h.to_lowercase();
            if h.starts_with("0x") { h } else { format!("0x{h}") }
        });

        let addresses = vec![
            self.cfg.ctf_exchange.to_lowercase(),
            self.cfg.neg_risk_ctf_exchange.to_lowercase(),
        ];
        let topic0 = order_filled_topic();

        let mut report = IndexerReport {
            from_block,
            to_block,
            ..Default::default()
        };
        // Token ids already sent through discovery this scan; a second miss
        // is a plain unknown, not another HTTP round-trip.
        let mut discovery_tried: HashSet<String> = HashSet::new();
        let mut timestamp_cache: HashMap<u64, u64> = HashMap::new();

        let mut current = from_block;
        while current <= to_block {
            let batch_end = (current + batch_size - 1).min(to_block);
            tracing::debug!("scanning blocks {current}-{batch_end} (of {to_block})");

            let logs = match self
                .rpc
                .get_logs(current, batch_end, &addresses, &topic0)
                .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    report
                        .warnings
                        .push(format!("Failed to fetch logs {current}-{batch_end}: {e}"));
                    current = batch_end + 1;
                    continue;
                }
            };
            report.total_logs += logs.len();

            // Bucket by block number and order within each block by log
            // index; provider ordering across blocks is irrelevant.
            let mut by_block: BTreeMap<u64, Vec<LogEntry>> = BTreeMap::new();
            for log in logs {
                by_block.entry(log.block_number_u64()).or_default().push(log);
            }
            for block_logs in by_block.values_mut() {
                block_logs.sort_by_key(|log| log.log_index_u64());
            }

            // Every block in the range checkpoints, even empty ones.
            for block_number in current..=batch_end {
                let mut rows: Vec<NewTrade> = Vec::new();

                if let Some(block_logs) = by_block.get(&block_number) {
                    match self
                        .rpc
                        .block_timestamp(block_number, &mut timestamp_cache)
                        .await
                    {
                        Ok(timestamp) => {
                            for log in block_logs {
                                if log.removed {
                                    continue;
                                }
                                if let Some(filter) = &tx_filter {
                                    if log.transaction_hash.to_lowercase() != *filter {
                                        continue;
                                    }
                                }
                                self.process_log(
                                    log,
                                    timestamp,
                                    &mut discovery_tried,
                                    &mut report,
                                    &mut rows,
                                )
                                .await?;
                            }
                        }
                        Err(e) => {
                            report.warnings.push(format!(
                                "Failed to fetch timestamp for block {block_number}: {e}"
                            ));
                        }
                    }
                }

                let decoded_count = rows.len();
                let inserted = self
                    .store
                    .call(move |conn| store::commit_block(conn, block_number, &rows))
                    .await?;
                report.skipped_trades += decoded_count - inserted.len();
                report.inserted_trades += inserted.len();
                for (id, trade) in inserted {
                    report.new_trades.push(InsertedTrade {
                        id,
                        market_id: trade.market_id,
                        tx_hash: trade.tx_hash,
                        side: trade.side,
                        outcome: trade.outcome,
                        price: trade.price,
                        size: trade.size,
                        usd_value: trade.price * trade.size,
                        token_id: trade.token_id,
                        timestamp: trade.timestamp,
                    });
                }
            }

            current = batch_end + 1;
        }

        Ok(report)
    }

    async fn process_log(
        &self,
        log: &LogEntry,
        timestamp: u64,
        discovery_tried: &mut HashSet<String>,
        report: &mut IndexerReport,
        rows: &mut Vec<NewTrade>,
    ) -> Result<()> {
        let Some(fill) = decode_order_filled(log) else {
            report.warnings.push(format!(
                "Failed to decode log {}:{}",
                log.transaction_hash,
                log.log_index_u64()
            ));
            return Ok(());
        };

        let token_id = fill.token_id.clone();
        let lookup = {
            let token_id = token_id.clone();
            self.store
                .call(move |conn| store::market_by_token_id(conn, &token_id))
                .await?
        };

        let market = match lookup {
            Some(market) => Some(market),
            None if discovery_tried.contains(&token_id) => None,
            None => {
                discovery_tried.insert(token_id.clone());
                match self.discovery.discover_by_token_id(&token_id).await {
                    Ok(Some(market)) => {
                        report.discovered_markets += 1;
                        Some(market)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        report
                            .warnings
                            .push(format!("Discovery failed for token {token_id}: {e}"));
                        None
                    }
                }
            }
        };

        let Some(market) = market else {
            // Unknown token: skip persistence but keep the log counted
            // toward the block checkpoint.
            report.unknown_tokens += 1;
            tracing::debug!("Unknown token_id: {}...", &token_id[..token_id.len().min(20)]);
            return Ok(());
        };

        let outcome = if market.yes_token_id.as_deref() == Some(token_id.as_str()) {
            "YES"
        } else if market.no_token_id.as_deref() == Some(token_id.as_str()) {
            "NO"
        } else {
            "UNKNOWN"
        };

        rows.push(NewTrade {
            market_id: market.id,
            tx_hash: fill.tx_hash.clone(),
            log_index: fill.log_index as i64,
            block_number: fill.block_number as i64,
            maker: fill.maker.clone(),
            taker: fill.taker.clone(),
            side: fill.side.as_str().into(),
            outcome: outcome.into(),
            price: fill.price(),
            size: fill.size(),
            fee: fill.fee(),
            token_id,
            timestamp: iso_utc(timestamp),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    fn fill_log(
        maker_asset: u64,
        taker_asset: u64,
        maker_amount: u64,
        taker_amount: u64,
        fee: u64,
    ) -> LogEntry {
        let maker = Address::repeat_byte(0x11);
        let taker = Address::repeat_byte(0x22);
        let mut data = Vec::with_capacity(160);
        for value in [maker_asset, taker_asset, maker_amount, taker_amount, fee] {
            data.extend_from_slice(&U256::from(value).to_be_bytes::<32>());
        }
        LogEntry {
            address: "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e".into(),
            topics: vec![
                OrderFilled::SIGNATURE_HASH.to_string(),
                B256::repeat_byte(0xaa).to_string(),
                maker.into_word().to_string(),
                taker.into_word().to_string(),
            ],
            data: format!("0x{}", hex::encode(data)),
            block_number: "0x69".into(),
            transaction_hash: "0xfeed".into(),
            log_index: "0x3".into(),
            removed: false,
        }
    }

    #[test]
    fn zero_maker_asset_is_a_buy_of_the_taker_asset() {
        let log = fill_log(0, 123, 50_000_000, 100_000_000, 1_000_000);
        let fill = decode_order_filled(&log).unwrap();
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.token_id, "123");
        assert_eq!(fill.usdc_raw, 50_000_000);
        assert_eq!(fill.token_raw, 100_000_000);
        assert!((fill.price() - 0.5).abs() < 1e-12);
        assert!((fill.size() - 100.0).abs() < 1e-12);
        assert!((fill.fee() - 1.0).abs() < 1e-12);
        assert_eq!(fill.block_number, 105);
        assert_eq!(fill.log_index, 3);
    }

    #[test]
    fn nonzero_maker_asset_is_a_sell_of_the_maker_asset() {
        let log = fill_log(456, 0, 200_000_000, 80_000_000, 0);
        let fill = decode_order_filled(&log).unwrap();
        assert_eq!(fill.side, Side::Sell);
        assert_eq!(fill.token_id, "456");
        assert_eq!(fill.usdc_raw, 80_000_000);
        assert_eq!(fill.token_raw, 200_000_000);
        assert!((fill.price() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn zero_token_amount_keeps_the_trade_at_price_zero() {
        let log = fill_log(0, 123, 50_000_000, 0, 0);
        let fill = decode_order_filled(&log).unwrap();
        assert_eq!(fill.price(), 0.0);
        assert_eq!(fill.size(), 0.0);
    }

    #[test]
    fn short_topic_lists_are_rejected() {
        let mut log = fill_log(0, 1, 1, 1, 0);
        log.topics.truncate(2);
        assert!(decode_order_filled(&log).is_none());
    }

    #[test]
    fn timestamps_render_as_utc_iso8601() {
        assert_eq!(iso_utc(1735334310), "2024-12-27T21:18:30Z");
    }

    #[test]
    fn topic0_matches_the_event_signature() {
        // keccak("OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)")
        assert_eq!(
            order_filled_topic(),
            "0xd0a08e8c493f9c94f29311604c9de1b4e8c8d4c06bd0c789af57f2d65bfec0f6"
        );
    }
}
