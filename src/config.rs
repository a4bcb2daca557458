use std::env;

/// Runtime configuration, loaded once from the environment (plus `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub rpc_url: String,
    pub gamma_api_base: String,
    pub data_api_base: String,
    /// Gamma host used for profile lookups (`/public-profile`). Usually the
    /// same as `gamma_api_base`, but overridable separately.
    pub gamma_profile_base: String,
    pub database_path: String,
    pub api_host: String,
    pub api_port: u16,
    pub whale_threshold: f64,
    pub sync_interval_secs: u64,
    pub enable_scheduler: bool,

    // Exchange contracts and collateral tokens on Polygon.
    pub ctf_exchange: String,
    pub neg_risk_ctf_exchange: String,
    pub usdc_e: String,
    pub wrapped_collateral: String,

    pub trader_stats_max_trades: usize,
    pub trader_level_max_trades: usize,
    pub trader_level_cache_ttl_secs: u64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            rpc_url: var_or("RPC_URL", "https://polygon-rpc.com"),
            gamma_api_base: var_or("GAMMA_API_BASE", "https://gamma-api.polymarket.com"),
            data_api_base: var_or(
                "POLYMARKET_DATA_API_BASE",
                "https://data-api.polymarket.com",
            ),
            gamma_profile_base: var_or(
                "POLYMARKET_GAMMA_API_BASE",
                "https://gamma-api.polymarket.com",
            ),
            database_path: var_or("DATABASE_PATH", "data/polypulse.db"),
            api_host: var_or("API_HOST", "0.0.0.0"),
            api_port: parse_or("API_PORT", 8000),
            whale_threshold: parse_or("WHALE_THRESHOLD", 1000.0),
            sync_interval_secs: parse_or("SYNC_INTERVAL", 10),
            enable_scheduler: var_or("ENABLE_SCHEDULER", "1") == "1",
            ctf_exchange: var_or(
                "CTF_EXCHANGE",
                "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E",
            ),
            neg_risk_ctf_exchange: var_or(
                "NEG_RISK_CTF_EXCHANGE",
                "0xC5d563A36AE78145C45a50134d48A1215220f80a",
            ),
            usdc_e: var_or("USDC_E", "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"),
            wrapped_collateral: var_or(
                "WRAPPED_COLLATERAL",
                "0x3A3BD7bb9528E159577F7C2e685CC81A765002E2",
            ),
            trader_stats_max_trades: parse_or("TRADER_STATS_MAX_TRADES", 10_000),
            trader_level_max_trades: parse_or("TRADER_LEVEL_MAX_TRADES", 10_000),
            trader_level_cache_ttl_secs: parse_or("TRADER_LEVEL_CACHE_TTL_SEC", 600),
        }
    }
}
