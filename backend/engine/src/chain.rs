//! Chain node JSON-RPC client, used to read the best block height, the
//! network name and whether the node's wallet answers.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the node is unreachable, rate-limits
//!   or returns a soft error, up to [`MAX_BACKOFF_SECS`] seconds.
//! * Method-not-found and invalid-request errors are returned immediately.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_ATTEMPTS: u32 = 5;

/// What the engine reads from its chain node.
#[async_trait]
pub trait ChainNode: Send + Sync {
    async fn best_block_height(&self) -> Result<i64>;
    /// Network name, e.g. `main` or `regtest`.
    async fn chain_name(&self) -> Result<String>;
    async fn wallet_available(&self) -> bool;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    height: i64,
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    chain: String,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct ChainRpcClient {
    client: Client,
    url: String,
    auth: Option<(String, String)>,
    initial_backoff: Duration,
}

impl ChainRpcClient {
    pub fn new(client: Client, url: String, user: Option<String>, password: Option<String>) -> Self {
        Self {
            client,
            url,
            auth: user.map(|u| (u, password.unwrap_or_default())),
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call_with_attempts(method, params, MAX_ATTEMPTS).await
    }

    async fn call_with_attempts<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        max_attempts: u32,
    ) -> Result<T> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut request = self.client.post(&self.url).json(&json!({
                "jsonrpc": "1.0",
                "id": "tokenisation-engine",
                "method": method,
                "params": params,
            }));
            if let Some((user, password)) = &self.auth {
                request = request.basic_auth(user, Some(password));
            }

            let retry_reason = match request.send().await {
                Err(e) => format!("request failed: {e}"),
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    "rate-limited".to_string()
                }
                Ok(resp) => {
                    let body: RpcResponse<T> = resp.json().await?;
                    match (body.result, body.error) {
                        (_, Some(err)) if err.code == -32600 || err.code == -32601 => {
                            return Err(EngineError::Chain(format!(
                                "{method} hard error {}: {}",
                                err.code, err.message
                            )));
                        }
                        (_, Some(err)) => format!("soft error {} {}", err.code, err.message),
                        (Some(result), None) => {
                            debug!(method, "Chain RPC call succeeded");
                            return Ok(result);
                        }
                        (None, None) => {
                            return Err(EngineError::Chain(format!("empty result from {method}")));
                        }
                    }
                }
            };

            if attempt >= max_attempts {
                return Err(EngineError::Chain(format!(
                    "{method} failed after {attempt} attempts: {retry_reason}"
                )));
            }
            warn!(
                "Chain RPC {method} {retry_reason} (will retry in {}s)",
                backoff.as_secs()
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
        }
    }
}

#[async_trait]
impl ChainNode for ChainRpcClient {
    async fn best_block_height(&self) -> Result<i64> {
        let best_hash: String = self.call("getbestblockhash", json!([])).await?;
        let header: BlockHeader = self.call("getblockheader", json!([best_hash])).await?;
        Ok(header.height)
    }

    async fn chain_name(&self) -> Result<String> {
        let info: BlockchainInfo = self.call("getblockchaininfo", json!([])).await?;
        Ok(info.chain)
    }

    /// One attempt only: a node without a wallet answers with an error.
    async fn wallet_available(&self) -> bool {
        self.call_with_attempts::<Value>("getwalletinfo", json!([]), 1)
            .await
            .is_ok()
    }
}
