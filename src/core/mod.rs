pub mod ctf;
pub mod db;
pub mod discovery;
pub mod indexer;
pub mod insights;
pub mod klines;
pub mod metrics;
pub mod rpc;
pub mod whales;
