use ed25519_dalek::SigningKey;
use sqlx::SqlitePool;

use crate::config::RetentionPolicy;
use crate::db;
use crate::errors::EngineError;
use crate::gossip;
use crate::invoices;
use crate::ledger::{self, BalanceSnapshot};
use crate::mints;
use crate::models::{
    new_id, now_unix, Confirmation, InvoiceStatus, SignatureRequirementType, UnconfirmedInvoice,
};
use crate::offers::{self, OfferSide};
use crate::protocol::{self, ActionType, InvoiceAction, MintAction};
use crate::retention;
use crate::test_support::{self, key, public_hex, sign_hex, withdrawal};

const OWNER: &str = "seller-addr";

async fn setup(
    policy: SignatureRequirementType,
    managers: &[&SigningKey],
    min_signatures: i64,
) -> (SqlitePool, String) {
    let pool = test_support::pool().await;
    let proposer = key(1);
    let terms = test_support::mint_terms(&proposer, policy, managers, min_signatures);
    let mint_hash = test_support::confirmed_mint(&pool, &proposer, terms).await;
    (pool, mint_hash)
}

async fn approve(
    pool: &SqlitePool,
    invoice_hash: &str,
    manager: &SigningKey,
) -> crate::errors::Result<InvoiceStatus> {
    let (gossip, _rx) = test_support::publisher();
    let invoice = invoices::get_unconfirmed_invoice(pool, invoice_hash)
        .await?
        .ok_or_else(|| EngineError::NotFound(invoice_hash.to_string()))?;
    let signature = sign_hex(manager, &invoice.approval_payload());
    let outcome = invoices::submit_invoice_signature(
        pool,
        &gossip,
        invoice_hash,
        public_hex(manager),
        signature,
    )
    .await?;
    Ok(outcome.status)
}

#[tokio::test]
async fn test_no_policy_confirms_and_reserves_immediately() {
    let (pool, mint_hash) = setup(SignatureRequirementType::None, &[], 0).await;
    let (invoice_hash, row) = test_support::announced_invoice(&pool, &mint_hash, 250, 20).await;

    let Confirmation::Confirmed(invoice) = invoices::try_confirm(&pool, &row).await.unwrap() else {
        panic!("expected confirmation");
    };
    assert_eq!(invoice.hash, invoice_hash);
    assert_eq!(invoice.status, InvoiceStatus::Confirmed);
    assert_eq!(invoice.block_height, 20);

    let pending = ledger::pending_for_invoice(&pool, &invoice_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((pending.quantity, pending.owner_address.as_str()), (250, OWNER));
    assert_eq!(ledger::available_balance(&pool, OWNER, &mint_hash).await.unwrap(), 750);
}

#[tokio::test]
async fn test_one_signature_gate_then_rerun_confirms() {
    let manager = key(20);
    let (pool, mint_hash) = setup(SignatureRequirementType::OneSignature, &[&manager], 0).await;
    let (invoice_hash, row) = test_support::announced_invoice(&pool, &mint_hash, 40, 20).await;

    let err = invoices::try_confirm(&pool, &row).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::SignaturePolicyUnsatisfied { invoice_hash: ref h, .. } if *h == invoice_hash
    ));
    let counts = db::table_counts(&pool).await.unwrap();
    assert_eq!(
        (
            counts.unconfirmed_invoices,
            counts.invoices,
            counts.pending_token_balances,
            counts.onchain_transactions
        ),
        (1, 0, 0, 1)
    );

    assert_eq!(
        approve(&pool, &invoice_hash, &manager).await.unwrap(),
        InvoiceStatus::Draft
    );

    let confirmed = invoices::try_confirm(&pool, &row).await.unwrap();
    assert!(matches!(confirmed, Confirmation::Confirmed(_)));
    let pending = ledger::pending_for_invoice(&pool, &invoice_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.quantity, 40);
}

#[tokio::test]
async fn test_all_signatures_needs_every_manager() {
    let managers = [key(20), key(21), key(22)];
    let refs: Vec<&SigningKey> = managers.iter().collect();
    let (pool, mint_hash) = setup(SignatureRequirementType::AllSignatures, &refs, 0).await;
    let (invoice_hash, row) = test_support::announced_invoice(&pool, &mint_hash, 10, 20).await;

    for manager in &managers[..2] {
        assert_eq!(
            approve(&pool, &invoice_hash, manager).await.unwrap(),
            InvoiceStatus::PendingSignatures
        );
    }
    // Repeating an approval does not count twice.
    approve(&pool, &invoice_hash, &managers[0]).await.unwrap();
    // Outsiders cannot sign.
    let err = approve(&pool, &invoice_hash, &key(99)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = invoices::try_confirm(&pool, &row).await.unwrap_err();
    assert!(matches!(err, EngineError::SignaturePolicyUnsatisfied { .. }));
    assert!(invoices::get_invoice(&pool, &invoice_hash).await.unwrap().is_none());

    assert_eq!(
        approve(&pool, &invoice_hash, &managers[2]).await.unwrap(),
        InvoiceStatus::Draft
    );
    assert!(matches!(
        invoices::try_confirm(&pool, &row).await.unwrap(),
        Confirmation::Confirmed(_)
    ));

    // The same row again is a no-op.
    let err = invoices::try_confirm(&pool, &row).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    let counts = db::table_counts(&pool).await.unwrap();
    assert_eq!((counts.invoices, counts.pending_token_balances), (1, 1));
}

#[tokio::test]
async fn test_min_signatures_threshold() {
    let managers = [key(20), key(21), key(22)];
    let refs: Vec<&SigningKey> = managers.iter().collect();
    let (pool, mint_hash) = setup(SignatureRequirementType::MinSignatures, &refs, 2).await;
    let (invoice_hash, row) = test_support::announced_invoice(&pool, &mint_hash, 10, 20).await;

    approve(&pool, &invoice_hash, &managers[1]).await.unwrap();
    assert!(invoices::try_confirm(&pool, &row).await.is_err());
    approve(&pool, &invoice_hash, &managers[2]).await.unwrap();
    assert!(matches!(
        invoices::try_confirm(&pool, &row).await.unwrap(),
        Confirmation::Confirmed(_)
    ));
}

#[tokio::test]
async fn test_replayed_mint_row_never_double_credits() {
    let pool = test_support::pool().await;
    let proposer = key(1);
    let terms = test_support::mint_terms(&proposer, SignatureRequirementType::None, &[], 0);
    let hash = terms.content_hash("owner").unwrap();
    let (gossip, _rx) = test_support::publisher();
    mints::create_mint(&pool, &gossip, terms, "owner".to_string(), sign_hex(&proposer, hash.as_bytes()))
        .await
        .unwrap();

    let action = MintAction {
        hash: protocol::hash_bytes(&hash).unwrap(),
    };
    let mut row = test_support::onchain(ActionType::Mint, action.encode(), 10, 0);
    row.tx_hash = hash.clone();
    db::insert_onchain_transaction(&pool, &row).await.unwrap();

    assert!(matches!(
        mints::try_confirm(&pool, &row).await.unwrap(),
        Confirmation::Confirmed(_)
    ));
    for _ in 0..3 {
        let err = mints::try_confirm(&pool, &row).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
    let balance = ledger::token_balance(&pool, OWNER, &hash).await.unwrap().unwrap();
    assert_eq!(balance.quantity, 1000);
}

#[tokio::test]
async fn test_mint_hash_mismatch_mutates_nothing() {
    let pool = test_support::pool().await;
    let proposer = key(1);
    let terms = test_support::mint_terms(&proposer, SignatureRequirementType::None, &[], 0);
    let hash = terms.content_hash("owner").unwrap();
    let (gossip, _rx) = test_support::publisher();
    mints::create_mint(&pool, &gossip, terms, "owner".to_string(), sign_hex(&proposer, hash.as_bytes()))
        .await
        .unwrap();

    let action = MintAction {
        hash: protocol::hash_bytes(&hash).unwrap(),
    };
    // Outer hash differs from the embedded one.
    let row = test_support::onchain(ActionType::Mint, action.encode(), 10, 0);
    db::insert_onchain_transaction(&pool, &row).await.unwrap();
    let before = db::table_counts(&pool).await.unwrap();

    assert_eq!(mints::try_confirm(&pool, &row).await.unwrap(), Confirmation::Mismatch);
    let after = db::table_counts(&pool).await.unwrap();
    assert_eq!(before, after);
    assert_eq!((after.unconfirmed_mints, after.mints, after.token_balances), (1, 0, 0));
}

#[tokio::test]
async fn test_invoice_payload_disagreement_mutates_nothing() {
    let (pool, mint_hash) = setup(SignatureRequirementType::None, &[], 0).await;
    let (invoice_hash, _) = test_support::announced_invoice(&pool, &mint_hash, 10, 20).await;

    let action = InvoiceAction {
        invoice_hash: protocol::hash_bytes(&invoice_hash).unwrap(),
        mint_hash: protocol::hash_bytes(&mint_hash).unwrap(),
        quantity: 11,
    };
    let row = test_support::onchain(ActionType::Invoice, action.encode(), 21, 0);
    db::insert_onchain_transaction(&pool, &row).await.unwrap();
    let before = db::table_counts(&pool).await.unwrap();

    assert_eq!(invoices::try_confirm(&pool, &row).await.unwrap(), Confirmation::Mismatch);
    assert_eq!(db::table_counts(&pool).await.unwrap(), before);
}

#[tokio::test]
async fn test_invoice_timeout_releases_reservation() {
    let (pool, mint_hash) = setup(SignatureRequirementType::None, &[], 0).await;
    let (invoice_hash, row) = test_support::announced_invoice(&pool, &mint_hash, 300, 20).await;
    invoices::try_confirm(&pool, &row).await.unwrap();
    assert_eq!(ledger::available_balance(&pool, OWNER, &mint_hash).await.unwrap(), 700);

    let policy = RetentionPolicy {
        invoice_timeout_blocks: 100,
        ..RetentionPolicy::default()
    };
    let report = retention::sweep(&pool, &policy, 50).await;
    assert_eq!(report.confirmed_invoices_expired, 0);

    let report = retention::sweep(&pool, &policy, 200).await;
    assert_eq!(report.confirmed_invoices_expired, 1);
    assert!(ledger::pending_for_invoice(&pool, &invoice_hash)
        .await
        .unwrap()
        .is_none());
    let invoice = invoices::get_invoice(&pool, &invoice_hash).await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Expired);
    assert_eq!(ledger::available_balance(&pool, OWNER, &mint_hash).await.unwrap(), 1000);

    // Already expired invoices are not touched again.
    let report = retention::sweep(&pool, &policy, 300).await;
    assert_eq!(report.confirmed_invoices_expired, 0);
}

#[tokio::test]
async fn test_gossip_rejects_tampered_invoice() {
    let (pool, mint_hash) = setup(SignatureRequirementType::None, &[], 0).await;
    let creator = key(9);
    let terms = test_support::invoice_terms(&creator, &mint_hash, 5);
    let signature = sign_hex(&creator, &terms.signing_payload().unwrap());
    let created_at = now_unix();
    let mut invoice = UnconfirmedInvoice {
        id: new_id(),
        hash: UnconfirmedInvoice::content_hash(&terms, created_at).unwrap(),
        terms,
        signature,
        status: InvoiceStatus::Draft,
        created_at,
    };
    invoice.terms.quantity = 500;

    let err = gossip::accept_gossip(&pool, gossip::GossipMessage::Invoice(invoice.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(msg) if msg.contains("content hash")));
    assert_eq!(db::table_counts(&pool).await.unwrap().unconfirmed_invoices, 0);

    // Restored terms pass.
    invoice.terms.quantity = 5;
    assert!(gossip::accept_gossip(&pool, gossip::GossipMessage::Invoice(invoice))
        .await
        .unwrap());
}

/// Current balances of the seller, checked against the ledger identity.
async fn balanced(pool: &SqlitePool, mint_hash: &str) -> BalanceSnapshot {
    let snapshot = ledger::balance_snapshot(pool, OWNER, mint_hash).await.unwrap();
    assert_eq!(
        snapshot.settled,
        snapshot.available() + snapshot.pending + snapshot.offered,
        "{snapshot:?}"
    );
    assert!(snapshot.available() >= 0, "{snapshot:?}");
    snapshot
}

#[tokio::test]
async fn test_offers_and_reservations_keep_ledger_balanced() {
    let (pool, mint_hash) = setup(SignatureRequirementType::None, &[], 0).await;
    let (gossip, _rx) = test_support::publisher();
    let signer = test_support::offer_signer();
    let parts = |s: BalanceSnapshot| (s.pending, s.offered, s.available());

    let first_offer = test_support::sell_offer(&pool, &mint_hash, 300, 1).await.unwrap();
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (0, 300, 700));

    let (_, first) = test_support::announced_invoice(&pool, &mint_hash, 400, 20).await;
    invoices::try_confirm(&pool, &first).await.unwrap();
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (400, 300, 300));

    let (second_hash, second) = test_support::announced_invoice(&pool, &mint_hash, 400, 21).await;
    let err = invoices::try_confirm(&pool, &second).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { available: 300, .. }));
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (400, 300, 300));

    let second_offer = test_support::sell_offer(&pool, &mint_hash, 300, 2).await.unwrap();
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (400, 600, 0));
    let err = test_support::sell_offer(&pool, &mint_hash, 1, 3).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { available: 0, .. }));

    offers::delete_offer(&pool, &gossip, OfferSide::Sell, withdrawal(&signer, &first_offer.hash))
        .await
        .unwrap();
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (400, 300, 300));
    assert!(invoices::try_confirm(&pool, &second).await.is_err());
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (400, 300, 300));

    offers::delete_offer(&pool, &gossip, OfferSide::Sell, withdrawal(&signer, &second_offer.hash))
        .await
        .unwrap();
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (400, 0, 600));
    let Confirmation::Confirmed(invoice) = invoices::try_confirm(&pool, &second).await.unwrap() else {
        panic!("expected confirmation");
    };
    assert_eq!(invoice.hash, second_hash);
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (800, 0, 200));

    let policy = RetentionPolicy {
        invoice_timeout_blocks: 100,
        ..RetentionPolicy::default()
    };
    let report = retention::sweep(&pool, &policy, 200).await;
    assert_eq!(report.confirmed_invoices_expired, 2);
    assert_eq!(parts(balanced(&pool, &mint_hash).await), (0, 0, 1000));
}
