//! Mint proposals and their confirmation against on-chain evidence.

use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::{debug, info};

use crate::crypto;
use crate::db::{self, Page, Paged};
use crate::errors::{EngineError, Result};
use crate::gossip::{GossipMessage, GossipPublisher};
use crate::ledger;
use crate::models::{
    new_id, Confirmation, Mint, MintTerms, OnChainTransaction, ProposalReceipt, UnconfirmedMint,
};
use crate::policy;
use crate::protocol::{self, Action, ActionType, Envelope, MintAction};

const TERM_COLUMNS: &str = "title, description, fraction_count, tags, metadata, feed_url, \
     public_key, signature_requirement_type, asset_managers, min_signatures";

/// A mint as currently known, confirmed or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MintRecord {
    Confirmed(Mint),
    Unconfirmed(UnconfirmedMint),
}

pub fn validate_terms(terms: &MintTerms) -> Result<()> {
    if terms.title.trim().is_empty() {
        return Err(EngineError::Validation("mint title is required".to_string()));
    }
    if terms.fraction_count <= 0 {
        return Err(EngineError::Validation(format!(
            "fraction count must be positive, got {}",
            terms.fraction_count
        )));
    }
    crypto::parse_public_key(&terms.public_key)?;
    for manager in &terms.asset_managers {
        crypto::parse_public_key(&manager.public_key)?;
    }
    policy::required_signatures(terms)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────

/// Store a proposal unless one with the same hash exists. Returns whether a
/// row was written.
pub async fn insert_unconfirmed_mint<'e>(
    executor: impl SqliteExecutor<'e>,
    mint: &UnconfirmedMint,
) -> Result<bool> {
    let t = &mint.terms;
    let inserted = sqlx::query(&format!(
        r#"
        INSERT OR IGNORE INTO unconfirmed_mints
            (id, hash, owner_address, {TERM_COLUMNS}, signature, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#
    ))
    .bind(&mint.id)
    .bind(&mint.hash)
    .bind(&mint.owner_address)
    .bind(&t.title)
    .bind(&t.description)
    .bind(t.fraction_count)
    .bind(sqlx::types::Json(&t.tags))
    .bind(sqlx::types::Json(&t.metadata))
    .bind(&t.feed_url)
    .bind(&t.public_key)
    .bind(t.signature_requirement_type.as_str())
    .bind(sqlx::types::Json(&t.asset_managers))
    .bind(t.min_signatures)
    .bind(&mint.signature)
    .bind(mint.created_at)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

async fn insert_mint(conn: &mut SqliteConnection, mint: &Mint) -> Result<()> {
    let t = &mint.terms;
    sqlx::query(&format!(
        r#"
        INSERT INTO mints
            (id, hash, owner_address, transaction_hash, block_height, {TERM_COLUMNS},
             signature, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#
    ))
    .bind(&mint.id)
    .bind(&mint.hash)
    .bind(&mint.owner_address)
    .bind(&mint.transaction_hash)
    .bind(mint.block_height)
    .bind(&t.title)
    .bind(&t.description)
    .bind(t.fraction_count)
    .bind(sqlx::types::Json(&t.tags))
    .bind(sqlx::types::Json(&t.metadata))
    .bind(&t.feed_url)
    .bind(&t.public_key)
    .bind(t.signature_requirement_type.as_str())
    .bind(sqlx::types::Json(&t.asset_managers))
    .bind(t.min_signatures)
    .bind(&mint.signature)
    .bind(mint.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_unconfirmed_mint<'e>(
    executor: impl SqliteExecutor<'e>,
    hash: &str,
) -> Result<Option<UnconfirmedMint>> {
    let row = sqlx::query_as::<_, UnconfirmedMint>(&format!(
        r#"
        SELECT id, hash, owner_address, {TERM_COLUMNS}, signature, created_at
        FROM   unconfirmed_mints
        WHERE  hash = ?1
        "#
    ))
    .bind(hash)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn get_mint<'e>(executor: impl SqliteExecutor<'e>, hash: &str) -> Result<Option<Mint>> {
    let row = sqlx::query_as::<_, Mint>(&format!(
        r#"
        SELECT id, hash, owner_address, transaction_hash, block_height, {TERM_COLUMNS},
               signature, created_at
        FROM   mints
        WHERE  hash = ?1
        "#
    ))
    .bind(hash)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Confirmed mints take precedence over a leftover proposal with the same hash.
pub async fn find_mint(pool: &SqlitePool, hash: &str) -> Result<MintRecord> {
    if let Some(mint) = get_mint(pool, hash).await? {
        return Ok(MintRecord::Confirmed(mint));
    }
    get_unconfirmed_mint(pool, hash)
        .await?
        .map(MintRecord::Unconfirmed)
        .ok_or_else(|| EngineError::NotFound(format!("mint {hash}")))
}

/// Confirmed mints, newest first, optionally only those owned by `owner_address`.
pub async fn list_mints(
    pool: &SqlitePool,
    owner_address: Option<&str>,
    page: Page,
) -> Result<Paged<Mint>> {
    let rows = sqlx::query_as::<_, Mint>(&format!(
        r#"
        SELECT id, hash, owner_address, transaction_hash, block_height, {TERM_COLUMNS},
               signature, created_at
        FROM   mints
        WHERE  (?1 IS NULL OR owner_address = ?1)
        ORDER  BY block_height DESC, id DESC
        LIMIT  ?2 OFFSET ?3
        "#
    ))
    .bind(owner_address)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    let (total,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM mints WHERE (?1 IS NULL OR owner_address = ?1)")
            .bind(owner_address)
            .fetch_one(pool)
            .await?;
    Ok(Paged::new(rows, total, page))
}

/// Keep the `keep` newest proposals and delete the rest.
pub async fn trim_unconfirmed_mints(pool: &SqlitePool, keep: i64) -> Result<u64> {
    let deleted = sqlx::query(
        r#"
        DELETE FROM unconfirmed_mints
        WHERE  id NOT IN (SELECT id FROM unconfirmed_mints
                          ORDER BY created_at DESC, id DESC
                          LIMIT ?1)
        "#,
    )
    .bind(keep.max(0))
    .execute(pool)
    .await?
    .rows_affected();
    Ok(deleted)
}

// ─────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────

/// Validate, store and gossip a new mint proposal. `signature` is the
/// proposer's signature over the resulting mint hash.
pub async fn create_mint(
    pool: &SqlitePool,
    gossip: &GossipPublisher,
    terms: MintTerms,
    owner_address: String,
    signature: String,
) -> Result<ProposalReceipt> {
    validate_terms(&terms)?;
    if owner_address.trim().is_empty() {
        return Err(EngineError::Validation("owner address is required".to_string()));
    }
    let mint = UnconfirmedMint::new(terms, owner_address, signature)?;
    crypto::verify(&mint.terms.public_key, &mint.signature, mint.hash.as_bytes())?;

    if get_mint(pool, &mint.hash).await?.is_some() || !insert_unconfirmed_mint(pool, &mint).await? {
        return Err(EngineError::Validation(format!("mint {} already exists", mint.hash)));
    }
    info!(hash = %mint.hash, owner = %mint.owner_address, "Stored unconfirmed mint");

    let envelope = Envelope::mint(&MintAction {
        hash: protocol::hash_bytes(&mint.hash)?,
    });
    let receipt = ProposalReceipt {
        hash: mint.hash.clone(),
        encoded_transaction_body: hex::encode(envelope.encode()),
    };
    gossip.publish(GossipMessage::Mint(mint));
    Ok(receipt)
}

fn decode_mint_action(onchain: &OnChainTransaction) -> Result<MintAction> {
    match protocol::decode_action(
        onchain.action_type,
        onchain.action_version,
        &onchain.action_payload,
    )? {
        Action::Mint(action) => Ok(action),
        other => Err(EngineError::Decode(format!("expected mint payload, got {other:?}"))),
    }
}

/// Whether `onchain` re-announces a mint that is already confirmed with the
/// same hash, height and transaction. The redundant row is deleted.
pub async fn match_confirmed_mint(pool: &SqlitePool, onchain: &OnChainTransaction) -> Result<bool> {
    if onchain.action_type != ActionType::Mint {
        return Ok(false);
    }
    let Ok(action) = decode_mint_action(onchain) else {
        return Ok(false);
    };
    let hash = action.hash_hex();
    if !hash.eq_ignore_ascii_case(&onchain.tx_hash) {
        return Ok(false);
    }

    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM mints WHERE hash = ?1 AND transaction_hash = ?2 AND block_height = ?3",
    )
    .bind(&hash)
    .bind(&onchain.tx_hash)
    .bind(onchain.block_height)
    .fetch_optional(pool)
    .await?;
    if existing.is_none() {
        return Ok(false);
    }

    sqlx::query("DELETE FROM onchain_transactions WHERE id = ?1")
        .bind(&onchain.id)
        .execute(pool)
        .await?;
    debug!(hash = %hash, "Dropped duplicate mint announcement");
    Ok(true)
}

/// Match `onchain` to an unconfirmed mint and, in one transaction, record the
/// confirmed mint, credit its owner with the full fraction count and consume
/// both the proposal and the on-chain row.
pub async fn try_confirm(
    pool: &SqlitePool,
    onchain: &OnChainTransaction,
) -> Result<Confirmation<Mint>> {
    if onchain.action_type != ActionType::Mint {
        return Err(EngineError::Validation(format!(
            "on-chain transaction {} is {}, not mint",
            onchain.id, onchain.action_type
        )));
    }
    let action = decode_mint_action(onchain)?;
    let hash = action.hash_hex();
    if !hash.eq_ignore_ascii_case(&onchain.tx_hash) {
        debug!(tx_hash = %onchain.tx_hash, payload_hash = %hash, "Mint payload hash mismatch");
        return Ok(Confirmation::Mismatch);
    }

    let mut tx = pool.begin().await?;
    let unconfirmed = get_unconfirmed_mint(&mut *tx, &hash)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("no unconfirmed mint for hash {hash}")))?;

    let mint = Mint {
        id: new_id(),
        hash,
        owner_address: onchain.address.clone(),
        transaction_hash: onchain.tx_hash.clone(),
        block_height: onchain.block_height,
        terms: unconfirmed.terms,
        signature: unconfirmed.signature,
        created_at: unconfirmed.created_at,
    };
    insert_mint(&mut tx, &mint).await?;
    ledger::credit(&mut tx, &mint.owner_address, &mint.hash, mint.terms.fraction_count).await?;
    sqlx::query("DELETE FROM unconfirmed_mints WHERE id = ?1")
        .bind(&unconfirmed.id)
        .execute(&mut *tx)
        .await?;
    db::consume_onchain_transaction(&mut tx, &onchain.id).await?;
    tx.commit().await?;

    info!(
        hash = %mint.hash,
        owner = %mint.owner_address,
        block_height = mint.block_height,
        fractions = mint.terms.fraction_count,
        "Mint confirmed"
    );
    Ok(Confirmation::Confirmed(mint))
}
