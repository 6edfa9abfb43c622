//! Health monitor: periodically records how far the engine has processed the
//! chain against the node's tip, plus the node's network and wallet status.
//! `GET /health` serves the last recorded row.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ChainNode;
use crate::db;
use crate::errors::Result;
use crate::models::now_unix;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct HealthStatus {
    /// Highest block the engine holds evidence for.
    pub current_block_height: i64,
    /// Node's best block.
    pub latest_block_height: i64,
    pub chain: String,
    pub wallets_enabled: bool,
    pub updated_at: i64,
}

pub async fn record(pool: &SqlitePool, status: &HealthStatus) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO health
            (id, current_block_height, latest_block_height, chain, wallets_enabled, updated_at)
        VALUES (1, ?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (id)
        DO UPDATE SET current_block_height = excluded.current_block_height,
                      latest_block_height  = excluded.latest_block_height,
                      chain                = excluded.chain,
                      wallets_enabled      = excluded.wallets_enabled,
                      updated_at           = excluded.updated_at
        "#,
    )
    .bind(status.current_block_height)
    .bind(status.latest_block_height)
    .bind(&status.chain)
    .bind(status.wallets_enabled)
    .bind(status.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load(pool: &SqlitePool) -> Result<Option<HealthStatus>> {
    let row = sqlx::query_as::<_, HealthStatus>(
        r#"
        SELECT current_block_height, latest_block_height, chain, wallets_enabled, updated_at
        FROM   health
        WHERE  id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Query the node once and store the result. Nothing is written when the
/// node cannot report its tip or network.
pub async fn check_once(pool: &SqlitePool, chain: &dyn ChainNode) -> Result<HealthStatus> {
    let latest_block_height = chain.best_block_height().await?;
    let chain_name = chain.chain_name().await?;
    let status = HealthStatus {
        current_block_height: db::processed_height(pool).await?,
        latest_block_height,
        chain: chain_name,
        wallets_enabled: chain.wallet_available().await,
        updated_at: now_unix(),
    };
    record(pool, &status).await?;
    Ok(status)
}

/// Check every `interval` until cancelled.
pub async fn run(
    pool: SqlitePool,
    chain: Arc<dyn ChainNode>,
    interval: Duration,
    token: CancellationToken,
) {
    info!("Health monitor starting (every {}s)", interval.as_secs());
    loop {
        match check_once(&pool, chain.as_ref()).await {
            Ok(status) => debug!(
                current = status.current_block_height,
                latest = status.latest_block_height,
                chain = %status.chain,
                "Health recorded"
            ),
            Err(e) => warn!("Health check failed: {e}"),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Health monitor stopped");
}
