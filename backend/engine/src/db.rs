//! Database layer: pool setup, embedded migrations, on-chain transaction rows
//! and table statistics.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::errors::{EngineError, Result};
use crate::models::OnChainTransaction;
use crate::protocol::ActionType;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let mut options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .busy_timeout(BUSY_TIMEOUT);
    if !url.contains(":memory:") {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// On-chain transaction rows
// ─────────────────────────────────────────────────────────

const ONCHAIN_COLUMNS: &str = r#"id, tx_hash, block_height, block_hash, tx_index, action_type,
       action_version, action_payload, address, "values", created_at"#;

/// Position of the last row a pipeline loop has seen, in scan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainCursor {
    pub block_height: i64,
    pub tx_index: i64,
    pub id: String,
}

impl OnChainCursor {
    pub fn start() -> Self {
        Self {
            block_height: i64::MIN,
            tx_index: i64::MIN,
            id: String::new(),
        }
    }

    pub fn after(tx: &OnChainTransaction) -> Self {
        Self {
            block_height: tx.block_height,
            tx_index: tx.tx_index,
            id: tx.id.clone(),
        }
    }
}

pub async fn insert_onchain_transaction<'e>(
    executor: impl SqliteExecutor<'e>,
    tx: &OnChainTransaction,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO onchain_transactions
            (id, tx_hash, block_height, block_hash, tx_index, action_type,
             action_version, action_payload, address, "values", created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&tx.id)
    .bind(&tx.tx_hash)
    .bind(tx.block_height)
    .bind(&tx.block_hash)
    .bind(tx.tx_index)
    .bind(i64::from(tx.action_type.code()))
    .bind(i64::from(tx.action_version))
    .bind(&tx.action_payload)
    .bind(&tx.address)
    .bind(sqlx::types::Json(&tx.values))
    .bind(tx.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Next page of rows of `action_type` strictly after `cursor`, in
/// `(block_height, tx_index, id)` order.
pub async fn list_onchain_transactions(
    pool: &SqlitePool,
    action_type: ActionType,
    cursor: &OnChainCursor,
    limit: u32,
) -> Result<Vec<OnChainTransaction>> {
    let sql = format!(
        r#"
        SELECT {ONCHAIN_COLUMNS}
        FROM   onchain_transactions
        WHERE  action_type = ?1
          AND  (block_height, tx_index, id) > (?2, ?3, ?4)
        ORDER  BY block_height ASC, tx_index ASC, id ASC
        LIMIT  ?5
        "#
    );
    let rows = sqlx::query_as::<_, OnChainTransaction>(&sql)
        .bind(i64::from(action_type.code()))
        .bind(cursor.block_height)
        .bind(cursor.tx_index)
        .bind(&cursor.id)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn get_onchain_transaction<'e>(
    executor: impl SqliteExecutor<'e>,
    id: &str,
) -> Result<Option<OnChainTransaction>> {
    let sql = format!("SELECT {ONCHAIN_COLUMNS} FROM onchain_transactions WHERE id = ?1");
    let row = sqlx::query_as::<_, OnChainTransaction>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Delete the row a confirmation consumed. Affecting anything other than
/// exactly one row means another worker already consumed it.
pub async fn consume_onchain_transaction(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM onchain_transactions WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if deleted != 1 {
        return Err(EngineError::NotFound(format!(
            "on-chain transaction {id} already consumed"
        )));
    }
    Ok(())
}

pub async fn trim_onchain_transactions_below(pool: &SqlitePool, height: i64) -> Result<u64> {
    let deleted = sqlx::query("DELETE FROM onchain_transactions WHERE block_height < ?1")
        .bind(height)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted)
}

/// Highest block height the engine holds evidence for, or 0 when it holds none.
pub async fn processed_height(pool: &SqlitePool) -> Result<i64> {
    let (height,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(MAX(h), 0) FROM (
            SELECT MAX(block_height) AS h FROM onchain_transactions
            UNION ALL
            SELECT MAX(block_height) FROM mints
            UNION ALL
            SELECT MAX(block_height) FROM invoices
        )
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(height)
}

// ─────────────────────────────────────────────────────────
// Pagination
// ─────────────────────────────────────────────────────────

pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE: u32 = 1000;

/// Zero-based page of a list query. Out-of-range values fall back to the
/// first page and the largest page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.filter(|p| *p <= MAX_PAGE).unwrap_or(0),
            limit: limit
                .filter(|l| (1..=MAX_PAGE_SIZE).contains(l))
                .unwrap_or(MAX_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.limit)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of rows plus the number of rows matching the query overall.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, total: i64, page: Page) -> Self {
        Self {
            items,
            total,
            page: page.page,
            limit: page.limit,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct TableCounts {
    pub unconfirmed_mints: i64,
    pub mints: i64,
    pub unconfirmed_invoices: i64,
    pub invoices: i64,
    pub invoice_signatures: i64,
    pub token_balances: i64,
    pub pending_token_balances: i64,
    pub sell_offers: i64,
    pub buy_offers: i64,
    pub onchain_transactions: i64,
}

pub async fn table_counts(pool: &SqlitePool) -> Result<TableCounts> {
    let counts = sqlx::query_as::<_, TableCounts>(
        r#"
        SELECT (SELECT COUNT(*) FROM unconfirmed_mints)      AS unconfirmed_mints,
               (SELECT COUNT(*) FROM mints)                  AS mints,
               (SELECT COUNT(*) FROM unconfirmed_invoices)   AS unconfirmed_invoices,
               (SELECT COUNT(*) FROM invoices)               AS invoices,
               (SELECT COUNT(*) FROM invoice_signatures)     AS invoice_signatures,
               (SELECT COUNT(*) FROM token_balances)         AS token_balances,
               (SELECT COUNT(*) FROM pending_token_balances) AS pending_token_balances,
               (SELECT COUNT(*) FROM sell_offers)            AS sell_offers,
               (SELECT COUNT(*) FROM buy_offers)             AS buy_offers,
               (SELECT COUNT(*) FROM onchain_transactions)   AS onchain_transactions
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn keyset_pages_in_block_order() {
        let pool = test_support::pool().await;
        for (height, index) in [(12, 0), (10, 1), (10, 0), (11, 5)] {
            let tx = test_support::onchain(ActionType::Mint, vec![0; 32], height, index);
            insert_onchain_transaction(&pool, &tx).await.unwrap();
        }
        let other = test_support::onchain(ActionType::Invoice, vec![0; 68], 1, 0);
        insert_onchain_transaction(&pool, &other).await.unwrap();

        let first = list_onchain_transactions(&pool, ActionType::Mint, &OnChainCursor::start(), 2)
            .await
            .unwrap();
        let order: Vec<_> = first.iter().map(|t| (t.block_height, t.tx_index)).collect();
        assert_eq!(order, vec![(10, 0), (10, 1)]);

        let cursor = OnChainCursor::after(first.last().unwrap());
        let second = list_onchain_transactions(&pool, ActionType::Mint, &cursor, 10)
            .await
            .unwrap();
        let order: Vec<_> = second.iter().map(|t| (t.block_height, t.tx_index)).collect();
        assert_eq!(order, vec![(11, 5), (12, 0)]);
    }

    #[tokio::test]
    async fn consume_is_at_most_once() {
        let pool = test_support::pool().await;
        let tx = test_support::onchain(ActionType::Mint, vec![0; 32], 1, 0);
        insert_onchain_transaction(&pool, &tx).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        consume_onchain_transaction(&mut conn, &tx.id).await.unwrap();
        let err = consume_onchain_transaction(&mut conn, &tx.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn stored_row_reads_back() {
        let pool = test_support::pool().await;
        let mut tx = test_support::onchain(ActionType::Unknown(9), b"junk".to_vec(), 3, 2);
        tx.values
            .insert("amount".to_string(), serde_json::json!(1500));
        insert_onchain_transaction(&pool, &tx).await.unwrap();

        let read = get_onchain_transaction(&pool, &tx.id).await.unwrap().unwrap();
        assert_eq!(read, tx);
    }

    #[tokio::test]
    async fn trims_only_below_height() {
        let pool = test_support::pool().await;
        for height in [5, 9, 10, 11] {
            let tx = test_support::onchain(ActionType::Payment, vec![0], height, 0);
            insert_onchain_transaction(&pool, &tx).await.unwrap();
        }
        assert_eq!(trim_onchain_transactions_below(&pool, 10).await.unwrap(), 2);
        assert_eq!(table_counts(&pool).await.unwrap().onchain_transactions, 2);
    }

    #[test]
    fn page_bounds_fall_back_to_defaults() {
        assert_eq!(Page::default(), Page { page: 0, limit: 100 });
        assert_eq!(Page::new(Some(3), Some(20)).offset(), 60);
        assert_eq!(Page::new(Some(1001), Some(0)), Page { page: 0, limit: 100 });
        assert_eq!(Page::new(None, Some(101)).limit, 100);
    }

    #[tokio::test]
    async fn processed_height_tracks_newest_evidence() {
        let pool = test_support::pool().await;
        assert_eq!(processed_height(&pool).await.unwrap(), 0);
        for height in [7, 42, 12] {
            let tx = test_support::onchain(ActionType::Mint, vec![0; 32], height, 0);
            insert_onchain_transaction(&pool, &tx).await.unwrap();
        }
        assert_eq!(processed_height(&pool).await.unwrap(), 42);
    }
}
