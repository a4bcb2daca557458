//! Minimal Polygon JSON-RPC client.
//!
//! Only the three calls the indexer needs: `eth_blockNumber`, `eth_getLogs`
//! and `eth_getBlockByNumber` (for timestamps). Requests go over plain
//! reqwest; Polygon's extended POA header fields never surface here because
//! we only deserialize the fields we read.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

/// One log from `eth_getLogs`, hex-encoded as the wire gives it to us.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

impl LogEntry {
    pub fn block_number_u64(&self) -> u64 {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u64(&self) -> u64 {
        parse_hex_u64(&self.log_index)
    }
}

pub fn parse_hex_u64(s: &str) -> u64 {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).unwrap_or(0)
}

#[derive(Deserialize)]
struct BlockResult {
    timestamp: String,
}

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;
        let rpc: RpcResponse<T> = resp.json().await?;
        if let Some(err) = rpc.error {
            return Err(Error::Rpc(format!("{method}: {err}")));
        }
        rpc.result
            .ok_or_else(|| Error::Rpc(format!("{method}: empty result")))
    }

    /// Current chain head.
    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self
            .call("eth_blockNumber", serde_json::json!([]), RPC_TIMEOUT)
            .await?;
        Ok(parse_hex_u64(&hex))
    }

    /// `eth_getLogs` over a block range, retried up to 3 times with
    /// exponential backoff (2s, 4s, 8s).
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[String],
        topic0: &str,
    ) -> Result<Vec<LogEntry>> {
        let params = serde_json::json!([{
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "address": addresses,
            "topics": [topic0],
        }]);

        let mut attempt = 0;
        loop {
            match self
                .call::<Vec<LogEntry>>("eth_getLogs", params.clone(), RPC_TIMEOUT)
                .await
            {
                Ok(logs) => return Ok(logs),
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    let wait = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    tracing::warn!(
                        "get_logs {from_block}-{to_block} failed (retry {}/{MAX_RETRIES} in {}s): {e}",
                        attempt + 1,
                        wait.as_secs()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Block timestamp, memoized in `cache` for the lifetime of a scan.
    pub async fn block_timestamp(
        &self,
        block_number: u64,
        cache: &mut HashMap<u64, u64>,
    ) -> Result<u64> {
        if let Some(ts) = cache.get(&block_number) {
            return Ok(*ts);
        }
        let block: BlockResult = self
            .call(
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{block_number:x}"), false]),
                BLOCK_TIMEOUT,
            )
            .await?;
        let ts = parse_hex_u64(&block.timestamp);
        cache.insert(block_number, ts);
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_hex_u64("0x0"), 0);
        assert_eq!(parse_hex_u64("0x3a2"), 930);
        assert_eq!(parse_hex_u64("not-hex"), 0);
    }

    #[test]
    fn log_entry_accessors() {
        let log: LogEntry = serde_json::from_value(serde_json::json!({
            "address": "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e",
            "topics": ["0xabc"],
            "data": "0x",
            "blockNumber": "0x69",
            "transactionHash": "0xdead",
            "logIndex": "0x2",
        }))
        .unwrap();
        assert_eq!(log.block_number_u64(), 105);
        assert_eq!(log.log_index_u64(), 2);
        assert!(!log.removed);
    }
}
