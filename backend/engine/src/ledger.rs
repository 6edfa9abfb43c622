//! Settled balances, invoice reservations and the spendable-balance guard.
//!
//! `available = settled - Σ pending reservations - Σ open sell offers`, always
//! recomputed from current rows. The guarded inserts below re-evaluate the
//! bound inside the insert statement itself, so a check and the write it
//! protects cannot interleave with another writer.

use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::db::{Page, Paged};
use crate::errors::{EngineError, Result};
use crate::models::{now_unix, PendingTokenBalance, SellOffer, TokenBalance};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct BalanceSnapshot {
    pub settled: i64,
    pub pending: i64,
    pub offered: i64,
}

impl BalanceSnapshot {
    pub fn available(&self) -> i64 {
        self.settled - self.pending - self.offered
    }
}

/// Additive upsert of a settled balance.
pub async fn credit(
    conn: &mut SqliteConnection,
    address: &str,
    mint_hash: &str,
    quantity: i64,
) -> Result<()> {
    if quantity <= 0 {
        return Err(EngineError::Validation(format!(
            "credit quantity must be positive, got {quantity}"
        )));
    }
    sqlx::query(
        r#"
        INSERT INTO token_balances (address, mint_hash, quantity, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (address, mint_hash)
        DO UPDATE SET quantity   = quantity + excluded.quantity,
                      updated_at = excluded.updated_at
        "#,
    )
    .bind(address)
    .bind(mint_hash)
    .bind(quantity)
    .bind(now_unix())
    .execute(&mut *conn)
    .await?;
    debug!(address, mint_hash, quantity, "balance credited");
    Ok(())
}

pub async fn token_balance<'e>(
    executor: impl SqliteExecutor<'e>,
    address: &str,
    mint_hash: &str,
) -> Result<Option<TokenBalance>> {
    let row = sqlx::query_as::<_, TokenBalance>(
        r#"
        SELECT address, mint_hash, quantity, updated_at
        FROM   token_balances
        WHERE  address = ?1 AND mint_hash = ?2
        "#,
    )
    .bind(address)
    .bind(mint_hash)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn balance_snapshot<'e>(
    executor: impl SqliteExecutor<'e>,
    address: &str,
    mint_hash: &str,
) -> Result<BalanceSnapshot> {
    let snapshot = sqlx::query_as::<_, BalanceSnapshot>(
        r#"
        SELECT COALESCE((SELECT quantity FROM token_balances
                         WHERE address = ?1 AND mint_hash = ?2), 0)       AS settled,
               COALESCE((SELECT SUM(quantity) FROM pending_token_balances
                         WHERE owner_address = ?1 AND mint_hash = ?2), 0) AS pending,
               COALESCE((SELECT SUM(quantity) FROM sell_offers
                         WHERE offerer_address = ?1 AND mint_hash = ?2), 0) AS offered
        "#,
    )
    .bind(address)
    .bind(mint_hash)
    .fetch_one(executor)
    .await?;
    Ok(snapshot)
}

pub async fn available_balance<'e>(
    executor: impl SqliteExecutor<'e>,
    address: &str,
    mint_hash: &str,
) -> Result<i64> {
    Ok(balance_snapshot(executor, address, mint_hash)
        .await?
        .available())
}

/// Fails with [`EngineError::InsufficientBalance`] when `requested` exceeds
/// what `address` can still commit. Offer insertion re-checks the same bound
/// through [`insert_sell_offer_if_covered`].
pub async fn assert_sufficient_for_offer<'e>(
    executor: impl SqliteExecutor<'e>,
    address: &str,
    mint_hash: &str,
    requested: i64,
) -> Result<()> {
    let available = available_balance(executor, address, mint_hash).await?;
    if requested > available {
        return Err(EngineError::InsufficientBalance {
            requested,
            available,
        });
    }
    Ok(())
}

/// Hold `quantity` of the owner's available balance for a confirmed invoice.
///
/// The bound is the same one sell offers are held to, so tokens already
/// committed to open offers cannot also be reserved. A second reservation for
/// the same invoice violates the primary key.
pub async fn reserve_for_invoice(
    conn: &mut SqliteConnection,
    invoice_hash: &str,
    mint_hash: &str,
    quantity: i64,
    owner_address: &str,
) -> Result<()> {
    if quantity <= 0 {
        return Err(EngineError::Validation(format!(
            "reservation quantity must be positive, got {quantity}"
        )));
    }
    let inserted = sqlx::query(
        r#"
        INSERT INTO pending_token_balances
            (invoice_hash, mint_hash, quantity, owner_address, created_at)
        SELECT ?1, ?2, ?3, ?4, ?5
        WHERE  COALESCE((SELECT quantity FROM token_balances
                         WHERE address = ?4 AND mint_hash = ?2), 0)
             - COALESCE((SELECT SUM(quantity) FROM pending_token_balances
                         WHERE owner_address = ?4 AND mint_hash = ?2), 0)
             - COALESCE((SELECT SUM(quantity) FROM sell_offers
                         WHERE offerer_address = ?4 AND mint_hash = ?2), 0) >= ?3
        "#,
    )
    .bind(invoice_hash)
    .bind(mint_hash)
    .bind(quantity)
    .bind(owner_address)
    .bind(now_unix())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        let available = available_balance(&mut *conn, owner_address, mint_hash).await?;
        return Err(EngineError::InsufficientBalance {
            requested: quantity,
            available,
        });
    }
    debug!(invoice_hash, owner_address, quantity, "balance reserved");
    Ok(())
}

pub async fn pending_for_invoice<'e>(
    executor: impl SqliteExecutor<'e>,
    invoice_hash: &str,
) -> Result<Option<PendingTokenBalance>> {
    let row = sqlx::query_as::<_, PendingTokenBalance>(
        r#"
        SELECT invoice_hash, mint_hash, quantity, owner_address, created_at
        FROM   pending_token_balances
        WHERE  invoice_hash = ?1
        "#,
    )
    .bind(invoice_hash)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Settled balances of `address`, largest first.
pub async fn list_token_balances(
    pool: &SqlitePool,
    address: &str,
    mint_hash: Option<&str>,
    page: Page,
) -> Result<Paged<TokenBalance>> {
    let rows = sqlx::query_as::<_, TokenBalance>(
        r#"
        SELECT address, mint_hash, quantity, updated_at
        FROM   token_balances
        WHERE  address = ?1 AND (?2 IS NULL OR mint_hash = ?2)
        ORDER  BY quantity DESC, mint_hash ASC
        LIMIT  ?3 OFFSET ?4
        "#,
    )
    .bind(address)
    .bind(mint_hash)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM token_balances WHERE address = ?1 AND (?2 IS NULL OR mint_hash = ?2)",
    )
    .bind(address)
    .bind(mint_hash)
    .fetch_one(pool)
    .await?;
    Ok(Paged::new(rows, total, page))
}

/// Reservations held against `address`, oldest first.
pub async fn list_pending_balances(
    pool: &SqlitePool,
    owner_address: &str,
    mint_hash: Option<&str>,
    page: Page,
) -> Result<Paged<PendingTokenBalance>> {
    let rows = sqlx::query_as::<_, PendingTokenBalance>(
        r#"
        SELECT invoice_hash, mint_hash, quantity, owner_address, created_at
        FROM   pending_token_balances
        WHERE  owner_address = ?1 AND (?2 IS NULL OR mint_hash = ?2)
        ORDER  BY created_at ASC, invoice_hash ASC
        LIMIT  ?3 OFFSET ?4
        "#,
    )
    .bind(owner_address)
    .bind(mint_hash)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    let (total,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM pending_token_balances
        WHERE  owner_address = ?1 AND (?2 IS NULL OR mint_hash = ?2)
        "#,
    )
    .bind(owner_address)
    .bind(mint_hash)
    .fetch_one(pool)
    .await?;
    Ok(Paged::new(rows, total, page))
}

/// Drop the reservation held for `invoice_hash`. Returns whether one existed.
pub async fn release_reservation<'e>(
    executor: impl SqliteExecutor<'e>,
    invoice_hash: &str,
) -> Result<bool> {
    let deleted = sqlx::query("DELETE FROM pending_token_balances WHERE invoice_hash = ?1")
        .bind(invoice_hash)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

/// Insert `offer` only if the offerer's available balance still covers it,
/// evaluated by the insert statement itself.
pub async fn insert_sell_offer_if_covered(
    conn: &mut SqliteConnection,
    offer: &SellOffer,
) -> Result<()> {
    let t = &offer.terms;
    let inserted = sqlx::query(
        r#"
        INSERT INTO sell_offers
            (id, hash, mint_hash, offerer_address, quantity, price, public_key,
             signature, created_at)
        SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
        WHERE  COALESCE((SELECT quantity FROM token_balances
                         WHERE address = ?4 AND mint_hash = ?3), 0)
             - COALESCE((SELECT SUM(quantity) FROM pending_token_balances
                         WHERE owner_address = ?4 AND mint_hash = ?3), 0)
             - COALESCE((SELECT SUM(quantity) FROM sell_offers
                         WHERE offerer_address = ?4 AND mint_hash = ?3), 0) >= ?5
        "#,
    )
    .bind(&offer.id)
    .bind(&offer.hash)
    .bind(&t.mint_hash)
    .bind(&t.offerer_address)
    .bind(t.quantity)
    .bind(t.price)
    .bind(&t.public_key)
    .bind(&offer.signature)
    .bind(offer.created_at)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        let available = available_balance(&mut *conn, &t.offerer_address, &t.mint_hash).await?;
        return Err(EngineError::InsufficientBalance {
            requested: t.quantity,
            available,
        });
    }
    Ok(())
}
