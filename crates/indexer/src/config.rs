//! Configuration management for the NFT event tracker.
//!
//! This module handles loading configuration from:
//! - TOML files
//! - Default values (fallbacks)
//!
//! The surface is read-only after boot.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use nfttrack_core::constants::{
    DEFAULT_FOLLOW_DISTANCE, DEFAULT_INDEXER_BATCH, DEFAULT_INDEXER_RETRY_LIMIT,
    DEFAULT_INDEXER_WORKERS, DEFAULT_RANGE_LIMIT, DEFAULT_RPC_PERMITS, DEFAULT_WS_ROTATE_LIMIT,
};

/// Main configuration for the tracker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active network.
    pub network: NetworkConfig,

    /// Tracked contract addresses.
    pub contracts: ContractsConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// RPC throttling and websocket rotation.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Per-contract tracker tuning.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Token-indexer pipeline tuning.
    #[serde(default)]
    pub indexer: PipelineConfig,

    /// Price-updater loop tuning.
    #[serde(default)]
    pub price_updater: PriceUpdaterConfig,

    /// Collection stat refresher tuning.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Hosted media settings.
    #[serde(default)]
    pub media: MediaConfig,

    /// Known pay tokens (currency whitelist for orders).
    #[serde(default)]
    pub pay_tokens: Vec<PayTokenConfig>,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network name, e.g. "mainnet".
    pub name: String,

    /// Chain ID.
    pub chain_id: u64,

    /// Average block time in seconds; paces backoff and stream waits.
    #[serde(default = "default_block_time_secs")]
    pub block_time_secs: u64,

    /// HTTP RPC URL (default endpoint).
    pub rpc_url: String,

    /// HTTP RPC URL of an archive node, for historical state queries.
    #[serde(default)]
    pub archive_rpc_url: Option<String>,

    /// WebSocket RPC URL, for subscriptions.
    pub ws_url: String,
}

/// Tracked contract addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractsConfig {
    /// Exchange contract (maker order fills and cancels).
    pub exchange: Address,

    /// Manifold royalty registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub royalty_registry: Option<Address>,

    /// ApeCoin staking contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apecoin_staking: Option<Address>,

    /// CryptoPunks contract. Late discovery of punk contracts requires
    /// a restart; only this boot-time address is tracked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub punk: Option<Address>,

    /// Strategy contract implementing fixed-price orders.
    pub strategy_fixed_price: Address,

    /// Strategy contract implementing private sales.
    pub strategy_private_sale: Address,

    /// Strategy contract implementing collection offers.
    pub strategy_collection_offer: Address,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://nfttrack.db").
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// RPC throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Concurrent in-flight call budget against one provider.
    #[serde(default = "default_rpc_permits")]
    pub max_concurrent_calls: usize,

    /// Subscribers per websocket connection before the pool rotates.
    #[serde(default = "default_ws_rotate_limit")]
    pub ws_rotate_limit: u32,

    /// Per-call deadline in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_rpc_permits(),
            ws_rotate_limit: default_ws_rotate_limit(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// Per-contract tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Blocks behind head considered safe.
    #[serde(default = "default_follow_distance")]
    pub follow_distance: u64,

    /// Block range per catch-up `eth_getLogs` query.
    #[serde(default = "default_range_limit")]
    pub range_limit: u64,

    /// Catalog rescan interval for newly-appropriate contracts, seconds.
    #[serde(default = "default_check_new_contract_interval_secs")]
    pub check_new_contract_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            follow_distance: default_follow_distance(),
            range_limit: default_range_limit(),
            check_new_contract_interval_secs: default_check_new_contract_interval_secs(),
        }
    }
}

/// Token-indexer pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Failures per item before parking it as invalid.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Items fetched per scan.
    #[serde(default = "default_batch")]
    pub batch: u32,

    /// Concurrent in-flight items.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Scan interval in seconds.
    #[serde(default = "default_pipeline_interval_secs")]
    pub interval_secs: u64,

    /// Metadata (attributes/animation) scan interval in seconds.
    #[serde(default = "default_metadata_interval_secs")]
    pub metadata_interval_secs: u64,

    /// IPFS gateways tried in order for `ipfs://` URIs.
    #[serde(default = "default_ipfs_gateways")]
    pub ipfs_gateways: Vec<String>,

    /// Hard cap on fetched metadata/image bytes.
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: usize,

    /// HTTP timeout for metadata and media fetches, seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            batch: default_batch(),
            workers: default_workers(),
            interval_secs: default_pipeline_interval_secs(),
            metadata_interval_secs: default_metadata_interval_secs(),
            ipfs_gateways: default_ipfs_gateways(),
            max_fetch_bytes: default_max_fetch_bytes(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

/// Price updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdaterConfig {
    /// Refresh interval in seconds.
    #[serde(default = "default_price_updater_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PriceUpdaterConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_price_updater_interval_secs(),
        }
    }
}

/// Collection stat refresher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Refresh interval in seconds.
    #[serde(default = "default_stats_interval_secs")]
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval_secs(),
        }
    }
}

/// Hosted media configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Local root directory for hosted assets.
    #[serde(default = "default_media_root")]
    pub root: String,

    /// Public base URL prepended to hosted paths.
    #[serde(default = "default_media_base_url")]
    pub base_url: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            base_url: default_media_base_url(),
        }
    }
}

/// One known pay token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayTokenConfig {
    /// Token contract address (zero address for the native coin).
    pub address: Address,

    /// Display symbol, e.g. "WETH".
    pub symbol: String,

    /// ERC-20 decimals.
    pub decimals: u8,

    /// USD rate per whole token, fed by an external updater.
    pub usd_rate: f64,

    /// Rate of this token in the chain's native coin.
    #[serde(default = "default_native_rate")]
    pub native_rate: f64,

    /// True for the chain's native coin and its canonical wrapper.
    #[serde(default)]
    pub is_native: bool,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.network.chain_id != 0, "network.chain_id must be set");
        anyhow::ensure!(
            self.network.block_time_secs > 0,
            "network.block_time_secs must be > 0"
        );
        anyhow::ensure!(!self.network.rpc_url.is_empty(), "network.rpc_url is empty");
        anyhow::ensure!(!self.network.ws_url.is_empty(), "network.ws_url is empty");
        anyhow::ensure!(!self.database.url.is_empty(), "database.url is empty");
        anyhow::ensure!(
            self.rpc.max_concurrent_calls > 0,
            "rpc.max_concurrent_calls must be > 0"
        );
        anyhow::ensure!(
            self.rpc.ws_rotate_limit > 0,
            "rpc.ws_rotate_limit must be > 0"
        );
        anyhow::ensure!(
            self.tracker.range_limit > 0,
            "tracker.range_limit must be > 0"
        );
        anyhow::ensure!(
            self.indexer.retry_limit > 0,
            "indexer.retry_limit must be > 0"
        );
        anyhow::ensure!(self.indexer.workers > 0, "indexer.workers must be > 0");
        anyhow::ensure!(
            !self.pay_tokens.is_empty(),
            "at least one pay token must be configured"
        );
        Ok(())
    }
}

fn default_block_time_secs() -> u64 {
    12
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_rpc_permits() -> usize {
    DEFAULT_RPC_PERMITS
}

fn default_ws_rotate_limit() -> u32 {
    DEFAULT_WS_ROTATE_LIMIT
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_follow_distance() -> u64 {
    DEFAULT_FOLLOW_DISTANCE
}

fn default_range_limit() -> u64 {
    DEFAULT_RANGE_LIMIT
}

fn default_check_new_contract_interval_secs() -> u64 {
    300
}

fn default_retry_limit() -> u32 {
    DEFAULT_INDEXER_RETRY_LIMIT
}

fn default_batch() -> u32 {
    DEFAULT_INDEXER_BATCH
}

fn default_workers() -> u32 {
    DEFAULT_INDEXER_WORKERS
}

fn default_pipeline_interval_secs() -> u64 {
    10
}

fn default_metadata_interval_secs() -> u64 {
    30
}

fn default_ipfs_gateways() -> Vec<String> {
    vec![
        "https://ipfs.io/ipfs/".to_string(),
        "https://cloudflare-ipfs.com/ipfs/".to_string(),
    ]
}

fn default_max_fetch_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

fn default_price_updater_interval_secs() -> u64 {
    60
}

fn default_stats_interval_secs() -> u64 {
    300
}

fn default_media_root() -> String {
    "./media".to_string()
}

fn default_media_base_url() -> String {
    "https://assets.local/".to_string()
}

fn default_native_rate() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[network]
name = "mainnet"
chain_id = 1
rpc_url = "http://localhost:8545"
ws_url = "ws://localhost:8546"

[contracts]
exchange = "0x59728544b08ab483533076417fbbb2fd0b17ce3a"
strategy_fixed_price = "0x0000000000000000000000000000000000000101"
strategy_private_sale = "0x0000000000000000000000000000000000000102"
strategy_collection_offer = "0x0000000000000000000000000000000000000103"

[database]
url = "sqlite://nfttrack.db"

[[pay_tokens]]
address = "0x0000000000000000000000000000000000000000"
symbol = "ETH"
decimals = 18
usd_rate = 2000.0
is_native = true
"#;

    #[test]
    fn parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.network.chain_id, 1);
        assert_eq!(config.network.block_time_secs, 12);
        assert_eq!(config.rpc.max_concurrent_calls, DEFAULT_RPC_PERMITS);
        assert_eq!(config.tracker.follow_distance, DEFAULT_FOLLOW_DISTANCE);
        assert_eq!(config.tracker.range_limit, DEFAULT_RANGE_LIMIT);
        assert_eq!(config.indexer.batch, DEFAULT_INDEXER_BATCH);
        assert!(config.contracts.punk.is_none());
        assert!(config.pay_tokens[0].is_native);
    }

    #[test]
    fn from_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.name, "mainnet");
    }

    #[test]
    fn rejects_zero_chain_id() {
        let bad = SAMPLE.replace("chain_id = 1", "chain_id = 0");
        let config: Config = toml::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_pay_tokens() {
        let bad = SAMPLE.split("[[pay_tokens]]").next().unwrap().to_string();
        let config: Config = toml::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }
}
