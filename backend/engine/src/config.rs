//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Chain node JSON-RPC endpoint used to read the best block height
    pub chain_rpc_url: String,
    pub chain_rpc_user: Option<String>,
    pub chain_rpc_password: Option<String>,
    /// Relay that forwards outbound gossip to peers; log-only when unset
    pub gossip_relay_url: Option<String>,
    /// Capacity of the outbound gossip queue
    pub gossip_queue_depth: usize,
    /// How often (in seconds) the confirmation loops scan on-chain rows
    pub confirm_poll_interval_secs: u64,
    /// Maximum number of on-chain rows read per page
    pub confirm_batch_size: u32,
    /// How often (in seconds) the retention sweep runs
    pub trim_interval_secs: u64,
    /// How often (in seconds) the health monitor queries the chain node
    pub health_interval_secs: u64,
    pub retention: RetentionPolicy,
    pub limits: OfferLimits,
}

/// Bounds applied by the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// On-chain rows below `tip - blocks_to_keep` are pruned.
    pub blocks_to_keep: i64,
    /// Newest unconfirmed mints retained; older ones are deleted.
    pub unconfirmed_mints_to_keep: i64,
    /// Unconfirmed invoices older than this are expired.
    pub unconfirmed_invoice_ttl: Duration,
    /// Confirmed invoices whose reservation is still held this many blocks
    /// after confirmation are expired and their reservation released.
    pub invoice_timeout_blocks: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            blocks_to_keep: 100,
            unconfirmed_mints_to_keep: 1_000,
            unconfirmed_invoice_ttl: Duration::from_secs(24 * 60 * 60),
            invoice_timeout_blocks: 100,
        }
    }
}

/// Per-party caps on open records, checked when new ones are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferLimits {
    pub sell_offers: i64,
    pub buy_offers: i64,
    pub invoices: i64,
}

impl Default for OfferLimits {
    fn default() -> Self {
        Self {
            sell_offers: 3,
            buy_offers: 3,
            invoices: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = RetentionPolicy::default();
        let limits = OfferLimits::default();

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./tokenisation.db".to_string()),
            api_port: parse_or("API_PORT", 8891)?,
            chain_rpc_url: env_var("CHAIN_RPC_URL").map_err(|_| {
                EngineError::Config("CHAIN_RPC_URL environment variable is required".to_string())
            })?,
            chain_rpc_user: env_var("CHAIN_RPC_USER").ok(),
            chain_rpc_password: env_var("CHAIN_RPC_PASSWORD").ok(),
            gossip_relay_url: env_var("GOSSIP_RELAY_URL").ok().filter(|s| !s.is_empty()),
            gossip_queue_depth: parse_or("GOSSIP_QUEUE_DEPTH", 1024)?,
            confirm_poll_interval_secs: parse_or("CONFIRM_POLL_INTERVAL_SECS", 5)?,
            confirm_batch_size: parse_or("CONFIRM_BATCH_SIZE", 100)?,
            trim_interval_secs: parse_or("TRIM_INTERVAL_SECS", 10)?,
            health_interval_secs: parse_or("HEALTH_INTERVAL_SECS", 10)?,
            retention: RetentionPolicy {
                blocks_to_keep: parse_or("BLOCKS_TO_KEEP", defaults.blocks_to_keep)?,
                unconfirmed_mints_to_keep: parse_or(
                    "UNCONFIRMED_MINTS_TO_KEEP",
                    defaults.unconfirmed_mints_to_keep,
                )?,
                unconfirmed_invoice_ttl: Duration::from_secs(parse_or(
                    "UNCONFIRMED_INVOICE_TTL_SECS",
                    defaults.unconfirmed_invoice_ttl.as_secs(),
                )?),
                invoice_timeout_blocks: parse_or(
                    "INVOICE_TIMEOUT_BLOCKS",
                    defaults.invoice_timeout_blocks,
                )?,
            },
            limits: OfferLimits {
                sell_offers: parse_or("SELL_OFFER_LIMIT", limits.sell_offers)?,
                buy_offers: parse_or("BUY_OFFER_LIMIT", limits.buy_offers)?,
                invoices: parse_or("INVOICE_LIMIT", limits.invoices)?,
            },
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
