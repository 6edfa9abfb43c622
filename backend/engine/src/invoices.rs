//! Invoice proposals, asset-manager approvals and invoice confirmation.

use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::{debug, info};

use crate::config::OfferLimits;
use crate::crypto;
use crate::db::{self, Page, Paged};
use crate::errors::{EngineError, Result};
use crate::gossip::{GossipMessage, GossipPublisher};
use crate::ledger;
use crate::mints;
use crate::models::{
    new_id, now_unix, Confirmation, Invoice, InvoiceSignature, InvoiceStatus, InvoiceTerms,
    OnChainTransaction, ProposalReceipt, UnconfirmedInvoice,
};
use crate::policy;
use crate::protocol::{self, Action, ActionType, Envelope, InvoiceAction, PaymentAction};

const TERM_COLUMNS: &str =
    "mint_hash, quantity, price, buyer_address, seller_address, payment_address, public_key";

/// Result of submitting an approval: the stored row and the invoice status
/// after it was counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureOutcome {
    pub signature: InvoiceSignature,
    pub status: InvoiceStatus,
}

// ─────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────

pub async fn insert_unconfirmed_invoice<'e>(
    executor: impl SqliteExecutor<'e>,
    invoice: &UnconfirmedInvoice,
) -> Result<bool> {
    let t = &invoice.terms;
    let inserted = sqlx::query(&format!(
        r#"
        INSERT OR IGNORE INTO unconfirmed_invoices
            (id, hash, {TERM_COLUMNS}, signature, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#
    ))
    .bind(&invoice.id)
    .bind(&invoice.hash)
    .bind(&t.mint_hash)
    .bind(t.quantity)
    .bind(t.price)
    .bind(&t.buyer_address)
    .bind(&t.seller_address)
    .bind(&t.payment_address)
    .bind(&t.public_key)
    .bind(&invoice.signature)
    .bind(invoice.status.as_str())
    .bind(invoice.created_at)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

async fn insert_invoice(conn: &mut SqliteConnection, invoice: &Invoice) -> Result<()> {
    let t = &invoice.terms;
    sqlx::query(&format!(
        r#"
        INSERT INTO invoices
            (id, hash, {TERM_COLUMNS}, signature, status, block_height,
             transaction_hash, created_at, confirmed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#
    ))
    .bind(&invoice.id)
    .bind(&invoice.hash)
    .bind(&t.mint_hash)
    .bind(t.quantity)
    .bind(t.price)
    .bind(&t.buyer_address)
    .bind(&t.seller_address)
    .bind(&t.payment_address)
    .bind(&t.public_key)
    .bind(&invoice.signature)
    .bind(invoice.status.as_str())
    .bind(invoice.block_height)
    .bind(&invoice.transaction_hash)
    .bind(invoice.created_at)
    .bind(invoice.confirmed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_unconfirmed_invoice<'e>(
    executor: impl SqliteExecutor<'e>,
    hash: &str,
) -> Result<Option<UnconfirmedInvoice>> {
    let row = sqlx::query_as::<_, UnconfirmedInvoice>(&format!(
        r#"
        SELECT id, hash, {TERM_COLUMNS}, signature, status, created_at
        FROM   unconfirmed_invoices
        WHERE  hash = ?1
        "#
    ))
    .bind(hash)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn get_invoice<'e>(
    executor: impl SqliteExecutor<'e>,
    hash: &str,
) -> Result<Option<Invoice>> {
    let row = sqlx::query_as::<_, Invoice>(&format!(
        r#"
        SELECT id, hash, {TERM_COLUMNS}, signature, status, block_height,
               transaction_hash, created_at, confirmed_at
        FROM   invoices
        WHERE  hash = ?1
        "#
    ))
    .bind(hash)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Confirmed invoices, newest first. `address` matches either party.
pub async fn list_invoices(
    pool: &SqlitePool,
    mint_hash: Option<&str>,
    address: Option<&str>,
    page: Page,
) -> Result<Paged<Invoice>> {
    const FILTER: &str = "(?1 IS NULL OR mint_hash = ?1) \
         AND (?2 IS NULL OR buyer_address = ?2 OR seller_address = ?2)";
    let rows = sqlx::query_as::<_, Invoice>(&format!(
        r#"
        SELECT id, hash, {TERM_COLUMNS}, signature, status, block_height,
               transaction_hash, created_at, confirmed_at
        FROM   invoices
        WHERE  {FILTER}
        ORDER  BY block_height DESC, id DESC
        LIMIT  ?3 OFFSET ?4
        "#
    ))
    .bind(mint_hash)
    .bind(address)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM invoices WHERE {FILTER}"))
        .bind(mint_hash)
        .bind(address)
        .fetch_one(pool)
        .await?;
    Ok(Paged::new(rows, total, page))
}

pub async fn list_signatures<'e>(
    executor: impl SqliteExecutor<'e>,
    invoice_hash: &str,
) -> Result<Vec<InvoiceSignature>> {
    let rows = sqlx::query_as::<_, InvoiceSignature>(
        r#"
        SELECT id, invoice_hash, public_key, signature, created_at
        FROM   invoice_signatures
        WHERE  invoice_hash = ?1
        ORDER  BY created_at ASC, id ASC
        "#,
    )
    .bind(invoice_hash)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Append an approval for `invoice` and promote the invoice to `draft` once
/// its policy is met. Returns whether the approval was new.
pub async fn record_signature(
    pool: &SqlitePool,
    invoice: &UnconfirmedInvoice,
    signature: &InvoiceSignature,
) -> Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO invoice_signatures
            (id, invoice_hash, public_key, signature, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&signature.id)
    .bind(&signature.invoice_hash)
    .bind(&signature.public_key)
    .bind(&signature.signature)
    .bind(signature.created_at)
    .execute(pool)
    .await?
    .rows_affected()
        > 0;

    if inserted && invoice.status == InvoiceStatus::PendingSignatures {
        promote_if_satisfied(pool, invoice).await?;
    }
    Ok(inserted)
}

async fn promote_if_satisfied(pool: &SqlitePool, invoice: &UnconfirmedInvoice) -> Result<()> {
    let Some(mint) = mints::get_mint(pool, &invoice.terms.mint_hash).await? else {
        return Ok(());
    };
    let signatures = list_signatures(pool, &invoice.hash).await?;
    if !policy::evaluate(&mint.terms, invoice, &signatures)?.satisfied {
        return Ok(());
    }
    sqlx::query(
        "UPDATE unconfirmed_invoices SET status = ?1 WHERE hash = ?2 AND status = ?3",
    )
    .bind(InvoiceStatus::Draft.as_str())
    .bind(&invoice.hash)
    .bind(InvoiceStatus::PendingSignatures.as_str())
    .execute(pool)
    .await?;
    debug!(hash = %invoice.hash, "Invoice signature policy met");
    Ok(())
}

async fn open_invoice_count(pool: &SqlitePool, mint_hash: &str, buyer_address: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM unconfirmed_invoices WHERE mint_hash = ?1 AND buyer_address = ?2",
    )
    .bind(mint_hash)
    .bind(buyer_address)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────

/// Validate, store and gossip an invoice against a confirmed mint.
/// `signature` is the creator's signature over the terms' signing payload.
pub async fn create_invoice(
    pool: &SqlitePool,
    gossip: &GossipPublisher,
    limits: &OfferLimits,
    terms: InvoiceTerms,
    signature: String,
) -> Result<ProposalReceipt> {
    let quantity = u32::try_from(terms.quantity)
        .ok()
        .filter(|q| *q > 0)
        .ok_or_else(|| {
            EngineError::Validation(format!("invoice quantity {} out of range", terms.quantity))
        })?;
    if terms.price < 0 {
        return Err(EngineError::Validation("invoice price must not be negative".to_string()));
    }
    for (field, value) in [
        ("buyer_address", &terms.buyer_address),
        ("seller_address", &terms.seller_address),
        ("payment_address", &terms.payment_address),
    ] {
        if value.trim().is_empty() {
            return Err(EngineError::Validation(format!("{field} is required")));
        }
    }
    crypto::verify(&terms.public_key, &signature, &terms.signing_payload()?)?;

    let mint = mints::get_mint(pool, &terms.mint_hash)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("mint {}", terms.mint_hash)))?;
    policy::required_signatures(&mint.terms)?;

    if open_invoice_count(pool, &terms.mint_hash, &terms.buyer_address).await? >= limits.invoices {
        return Err(EngineError::Validation(format!(
            "buyer {} already has {} open invoices for mint {}",
            terms.buyer_address, limits.invoices, terms.mint_hash
        )));
    }

    let created_at = now_unix();
    let invoice = UnconfirmedInvoice {
        id: new_id(),
        hash: UnconfirmedInvoice::content_hash(&terms, created_at)?,
        status: InvoiceStatus::initial_for(mint.terms.signature_requirement_type),
        terms,
        signature,
        created_at,
    };
    if !insert_unconfirmed_invoice(pool, &invoice).await? {
        return Err(EngineError::Validation(format!("invoice {} already exists", invoice.hash)));
    }
    info!(
        hash = %invoice.hash,
        mint_hash = %invoice.terms.mint_hash,
        status = invoice.status.as_str(),
        "Stored unconfirmed invoice"
    );

    let envelope = Envelope::invoice(&InvoiceAction {
        invoice_hash: protocol::hash_bytes(&invoice.hash)?,
        mint_hash: protocol::hash_bytes(&invoice.terms.mint_hash)?,
        quantity,
    });
    let receipt = ProposalReceipt {
        hash: invoice.hash.clone(),
        encoded_transaction_body: hex::encode(envelope.encode()),
    };
    gossip.publish(GossipMessage::Invoice(invoice));
    Ok(receipt)
}

/// Record an asset manager's approval of an unconfirmed invoice. Never
/// confirms anything by itself.
pub async fn submit_invoice_signature(
    pool: &SqlitePool,
    gossip: &GossipPublisher,
    invoice_hash: &str,
    public_key: String,
    signature: String,
) -> Result<SignatureOutcome> {
    let invoice = get_unconfirmed_invoice(pool, invoice_hash)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("invoice {invoice_hash}")))?;
    let mint = mints::get_mint(pool, &invoice.terms.mint_hash)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("mint {}", invoice.terms.mint_hash)))?;
    if !mint.terms.is_registered_manager(&public_key) {
        return Err(EngineError::Validation(format!(
            "{public_key} is not an asset manager of mint {}",
            mint.hash
        )));
    }
    crypto::verify(&public_key, &signature, &invoice.approval_payload())?;

    let approval = InvoiceSignature::new(invoice.hash.clone(), public_key, signature);
    if record_signature(pool, &invoice, &approval).await? {
        info!(invoice_hash = %invoice.hash, signer = %approval.public_key, "Invoice signature recorded");
        gossip.publish(GossipMessage::InvoiceSignature(approval.clone()));
    }

    let status = get_unconfirmed_invoice(pool, invoice_hash)
        .await?
        .map(|i| i.status)
        .unwrap_or(invoice.status);
    Ok(SignatureOutcome {
        signature: approval,
        status,
    })
}

fn decode_invoice_action(onchain: &OnChainTransaction) -> Result<InvoiceAction> {
    match protocol::decode_action(
        onchain.action_type,
        onchain.action_version,
        &onchain.action_payload,
    )? {
        Action::Invoice(action) => Ok(action),
        other => Err(EngineError::Decode(format!("expected invoice payload, got {other:?}"))),
    }
}

/// Match `onchain` to an unconfirmed invoice, check its mint's signature
/// policy and, in one transaction, record the confirmed invoice, reserve the
/// quantity against the seller and consume the proposal and on-chain row.
pub async fn try_confirm(
    pool: &SqlitePool,
    onchain: &OnChainTransaction,
) -> Result<Confirmation<Invoice>> {
    if onchain.action_type != ActionType::Invoice {
        return Err(EngineError::Validation(format!(
            "on-chain transaction {} is {}, not invoice",
            onchain.id, onchain.action_type
        )));
    }
    let action = decode_invoice_action(onchain)?;
    let invoice_hash = action.invoice_hash_hex();

    let mut tx = pool.begin().await?;
    let unconfirmed = get_unconfirmed_invoice(&mut *tx, &invoice_hash)
        .await?
        .ok_or_else(|| {
            EngineError::NotFound(format!("no unconfirmed invoice for hash {invoice_hash}"))
        })?;

    if !action.mint_hash_hex().eq_ignore_ascii_case(&unconfirmed.terms.mint_hash)
        || i64::from(action.quantity) != unconfirmed.terms.quantity
    {
        debug!(hash = %invoice_hash, "Invoice payload disagrees with stored invoice");
        return Ok(Confirmation::Mismatch);
    }

    let mint = mints::get_mint(&mut *tx, &unconfirmed.terms.mint_hash)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("mint {}", unconfirmed.terms.mint_hash)))?;
    let signatures = list_signatures(&mut *tx, &invoice_hash).await?;
    let verdict = policy::require_satisfied(&mint.terms, &unconfirmed, &signatures)?;

    let invoice = Invoice {
        id: new_id(),
        hash: unconfirmed.hash,
        terms: unconfirmed.terms,
        signature: unconfirmed.signature,
        status: InvoiceStatus::Confirmed,
        block_height: onchain.block_height,
        transaction_hash: onchain.tx_hash.clone(),
        created_at: unconfirmed.created_at,
        confirmed_at: now_unix(),
    };
    insert_invoice(&mut tx, &invoice).await?;
    ledger::reserve_for_invoice(
        &mut tx,
        &invoice.hash,
        &invoice.terms.mint_hash,
        invoice.terms.quantity,
        &invoice.terms.seller_address,
    )
    .await?;
    sqlx::query("DELETE FROM unconfirmed_invoices WHERE id = ?1")
        .bind(&unconfirmed.id)
        .execute(&mut *tx)
        .await?;
    db::consume_onchain_transaction(&mut tx, &onchain.id).await?;
    tx.commit().await?;

    info!(
        hash = %invoice.hash,
        seller = %invoice.terms.seller_address,
        quantity = invoice.terms.quantity,
        signers = verdict.valid_signers,
        "Invoice confirmed"
    );
    Ok(Confirmation::Confirmed(invoice))
}

/// Build the PAYMENT envelope a buyer broadcasts to settle a confirmed
/// invoice. Nothing is stored.
pub async fn create_payment(pool: &SqlitePool, invoice_hash: &str) -> Result<ProposalReceipt> {
    let invoice_hash = invoice_hash.trim().to_lowercase();
    let action = PaymentAction {
        invoice_hash: protocol::hash_bytes(&invoice_hash)?,
    };
    let invoice = get_invoice(pool, &invoice_hash)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("confirmed invoice {invoice_hash}")))?;
    if invoice.status != InvoiceStatus::Confirmed {
        return Err(EngineError::Validation(format!(
            "invoice {invoice_hash} is {}, not payable",
            invoice.status.as_str()
        )));
    }
    debug!(hash = %invoice_hash, "Payment envelope built");
    Ok(ProposalReceipt {
        hash: invoice_hash,
        encoded_transaction_body: hex::encode(Envelope::payment(&action).encode()),
    })
}

// ─────────────────────────────────────────────────────────
// Expiry
// ─────────────────────────────────────────────────────────

/// Delete unconfirmed invoices created before `cutoff` (Unix seconds).
pub async fn expire_unconfirmed_invoices(pool: &SqlitePool, cutoff: i64) -> Result<u64> {
    let deleted = sqlx::query("DELETE FROM unconfirmed_invoices WHERE created_at < ?1")
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted)
}

/// Release reservations of confirmed invoices confirmed below `height` and
/// mark those invoices expired.
pub async fn expire_confirmed_invoices(pool: &SqlitePool, height: i64) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let stale: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT i.hash
        FROM   invoices i
        JOIN   pending_token_balances p ON p.invoice_hash = i.hash
        WHERE  i.status = ?1 AND i.block_height < ?2
        "#,
    )
    .bind(InvoiceStatus::Confirmed.as_str())
    .bind(height)
    .fetch_all(&mut *tx)
    .await?;

    for (hash,) in &stale {
        ledger::release_reservation(&mut *tx, hash).await?;
        sqlx::query("UPDATE invoices SET status = ?1 WHERE hash = ?2")
            .bind(InvoiceStatus::Expired.as_str())
            .bind(hash)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(stale.len() as u64)
}
