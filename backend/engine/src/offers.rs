//! Standing sell and buy offers.
//!
//! A sell offer commits part of the offerer's available balance until it is
//! withdrawn; a buy offer commits nothing on either side.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::info;

use crate::config::OfferLimits;
use crate::crypto;
use crate::db::{Page, Paged};
use crate::errors::{EngineError, Result};
use crate::gossip::{GossipMessage, GossipPublisher};
use crate::ledger;
use crate::models::{
    delete_offer_payload, new_id, now_unix, BuyOffer, BuyOfferTerms, SellOffer, SellOfferTerms,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferSide {
    Sell,
    Buy,
}

impl OfferSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
        }
    }

    fn table(self) -> &'static str {
        match self {
            Self::Sell => "sell_offers",
            Self::Buy => "buy_offers",
        }
    }
}

/// An owner-signed withdrawal of an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferDeletion {
    pub hash: String,
    pub public_key: String,
    /// Signature over [`delete_offer_payload`] for `hash`.
    pub signature: String,
}

fn validate_amounts(quantity: i64, price: i64) -> Result<()> {
    if quantity <= 0 {
        return Err(EngineError::Validation(format!(
            "offer quantity must be positive, got {quantity}"
        )));
    }
    if price < 0 {
        return Err(EngineError::Validation("offer price must not be negative".to_string()));
    }
    Ok(())
}

pub async fn sell_offer_exists(pool: &SqlitePool, hash: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as("SELECT id FROM sell_offers WHERE hash = ?1")
        .bind(hash)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn insert_buy_offer<'e>(
    executor: impl SqliteExecutor<'e>,
    offer: &BuyOffer,
) -> Result<bool> {
    let t = &offer.terms;
    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO buy_offers
            (id, hash, mint_hash, offerer_address, seller_address, quantity, price,
             public_key, signature, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&offer.id)
    .bind(&offer.hash)
    .bind(&t.mint_hash)
    .bind(&t.offerer_address)
    .bind(&t.seller_address)
    .bind(t.quantity)
    .bind(t.price)
    .bind(&t.public_key)
    .bind(&offer.signature)
    .bind(offer.created_at)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

pub async fn list_sell_offers(
    pool: &SqlitePool,
    mint_hash: &str,
    offerer_address: &str,
) -> Result<Vec<SellOffer>> {
    let rows = sqlx::query_as::<_, SellOffer>(
        r#"
        SELECT id, hash, mint_hash, offerer_address, quantity, price, public_key,
               signature, created_at
        FROM   sell_offers
        WHERE  mint_hash = ?1 AND offerer_address = ?2
        ORDER  BY created_at ASC, id ASC
        "#,
    )
    .bind(mint_hash)
    .bind(offerer_address)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Open sell offers, oldest first, optionally narrowed by mint and offerer.
pub async fn page_sell_offers(
    pool: &SqlitePool,
    mint_hash: Option<&str>,
    offerer_address: Option<&str>,
    page: Page,
) -> Result<Paged<SellOffer>> {
    const FILTER: &str = "(?1 IS NULL OR mint_hash = ?1) AND (?2 IS NULL OR offerer_address = ?2)";
    let rows = sqlx::query_as::<_, SellOffer>(&format!(
        r#"
        SELECT id, hash, mint_hash, offerer_address, quantity, price, public_key,
               signature, created_at
        FROM   sell_offers
        WHERE  {FILTER}
        ORDER  BY created_at ASC, id ASC
        LIMIT  ?3 OFFSET ?4
        "#
    ))
    .bind(mint_hash)
    .bind(offerer_address)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    let (total,): (i64,) =
        sqlx::query_as(&format!("SELECT COUNT(*) FROM sell_offers WHERE {FILTER}"))
            .bind(mint_hash)
            .bind(offerer_address)
            .fetch_one(pool)
            .await?;
    Ok(Paged::new(rows, total, page))
}

/// Open buy offers, oldest first, optionally narrowed by mint and either party.
pub async fn page_buy_offers(
    pool: &SqlitePool,
    mint_hash: Option<&str>,
    offerer_address: Option<&str>,
    seller_address: Option<&str>,
    page: Page,
) -> Result<Paged<BuyOffer>> {
    const FILTER: &str = "(?1 IS NULL OR mint_hash = ?1) \
         AND (?2 IS NULL OR offerer_address = ?2) \
         AND (?3 IS NULL OR seller_address = ?3)";
    let rows = sqlx::query_as::<_, BuyOffer>(&format!(
        r#"
        SELECT id, hash, mint_hash, offerer_address, seller_address, quantity, price,
               public_key, signature, created_at
        FROM   buy_offers
        WHERE  {FILTER}
        ORDER  BY created_at ASC, id ASC
        LIMIT  ?4 OFFSET ?5
        "#
    ))
    .bind(mint_hash)
    .bind(offerer_address)
    .bind(seller_address)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM buy_offers WHERE {FILTER}"))
        .bind(mint_hash)
        .bind(offerer_address)
        .bind(seller_address)
        .fetch_one(pool)
        .await?;
    Ok(Paged::new(rows, total, page))
}

/// Delete the offer named by `deletion` if the signature authorises it and
/// the stored row belongs to the signing key. Returns whether a row went.
pub async fn remove_offer(
    pool: &SqlitePool,
    side: OfferSide,
    deletion: &OfferDeletion,
) -> Result<bool> {
    crypto::verify(
        &deletion.public_key,
        &deletion.signature,
        &delete_offer_payload(&deletion.hash),
    )?;
    let sql = format!(
        "DELETE FROM {} WHERE hash = ?1 AND lower(public_key) = lower(?2)",
        side.table()
    );
    let deleted = sqlx::query(&sql)
        .bind(&deletion.hash)
        .bind(&deletion.public_key)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

// ─────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────

/// Validate, guard against overselling, store and gossip a sell offer.
pub async fn create_sell_offer(
    pool: &SqlitePool,
    gossip: &GossipPublisher,
    limits: &OfferLimits,
    terms: SellOfferTerms,
    signature: String,
) -> Result<SellOffer> {
    validate_amounts(terms.quantity, terms.price)?;
    crypto::verify(&terms.public_key, &signature, &terms.signing_payload()?)?;

    let open = list_sell_offers(pool, &terms.mint_hash, &terms.offerer_address).await?;
    if open.len() as i64 >= limits.sell_offers {
        return Err(EngineError::Validation(format!(
            "{} already has {} sell offers for mint {}",
            terms.offerer_address, limits.sell_offers, terms.mint_hash
        )));
    }
    ledger::assert_sufficient_for_offer(pool, &terms.offerer_address, &terms.mint_hash, terms.quantity)
        .await?;

    let created_at = now_unix();
    let offer = SellOffer {
        id: new_id(),
        hash: SellOffer::content_hash(&terms, created_at)?,
        terms,
        signature,
        created_at,
    };
    if sell_offer_exists(pool, &offer.hash).await? {
        return Err(EngineError::Validation(format!("sell offer {} already exists", offer.hash)));
    }
    let mut conn = pool.acquire().await?;
    ledger::insert_sell_offer_if_covered(&mut conn, &offer).await?;
    drop(conn);

    info!(
        hash = %offer.hash,
        offerer = %offer.terms.offerer_address,
        quantity = offer.terms.quantity,
        "Stored sell offer"
    );
    gossip.publish(GossipMessage::SellOffer(offer.clone()));
    Ok(offer)
}

pub async fn create_buy_offer(
    pool: &SqlitePool,
    gossip: &GossipPublisher,
    limits: &OfferLimits,
    terms: BuyOfferTerms,
    signature: String,
) -> Result<BuyOffer> {
    validate_amounts(terms.quantity, terms.price)?;
    crypto::verify(&terms.public_key, &signature, &terms.signing_payload()?)?;

    let (open,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM buy_offers
        WHERE  mint_hash = ?1 AND offerer_address = ?2 AND seller_address = ?3
        "#,
    )
    .bind(&terms.mint_hash)
    .bind(&terms.offerer_address)
    .bind(&terms.seller_address)
    .fetch_one(pool)
    .await?;
    if open >= limits.buy_offers {
        return Err(EngineError::Validation(format!(
            "{} already has {} buy offers to {} for mint {}",
            terms.offerer_address, limits.buy_offers, terms.seller_address, terms.mint_hash
        )));
    }

    let created_at = now_unix();
    let offer = BuyOffer {
        id: new_id(),
        hash: BuyOffer::content_hash(&terms, created_at)?,
        terms,
        signature,
        created_at,
    };
    if !insert_buy_offer(pool, &offer).await? {
        return Err(EngineError::Validation(format!("buy offer {} already exists", offer.hash)));
    }
    info!(hash = %offer.hash, offerer = %offer.terms.offerer_address, "Stored buy offer");
    gossip.publish(GossipMessage::BuyOffer(offer.clone()));
    Ok(offer)
}

/// Owner-authorised withdrawal of an offer; the deletion is gossiped.
pub async fn delete_offer(
    pool: &SqlitePool,
    gossip: &GossipPublisher,
    side: OfferSide,
    deletion: OfferDeletion,
) -> Result<()> {
    if !remove_offer(pool, side, &deletion).await? {
        return Err(EngineError::NotFound(format!(
            "{} offer {} owned by {}",
            side.as_str(),
            deletion.hash,
            deletion.public_key
        )));
    }
    info!(hash = %deletion.hash, side = side.as_str(), "Offer withdrawn");
    let message = match side {
        OfferSide::Sell => GossipMessage::DeleteSellOffer(deletion),
        OfferSide::Buy => GossipMessage::DeleteBuyOffer(deletion),
    };
    gossip.publish(message);
    Ok(())
}
