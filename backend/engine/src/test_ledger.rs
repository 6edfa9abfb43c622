use sqlx::SqlitePool;

use crate::db;
use crate::errors::EngineError;
use crate::invoices;
use crate::ledger::{self, BalanceSnapshot};
use crate::models::{Confirmation, SellOffer, SignatureRequirementType};
use crate::offers::{self, OfferSide};
use crate::test_support::{self, key, withdrawal};

const OWNER: &str = "seller-addr";

async fn setup(pool: &SqlitePool) -> String {
    let proposer = key(1);
    let terms = test_support::mint_terms(&proposer, SignatureRequirementType::None, &[], 0);
    test_support::confirmed_mint(pool, &proposer, terms).await
}

async fn offer(
    pool: &SqlitePool,
    mint_hash: &str,
    quantity: i64,
    price: i64,
) -> crate::errors::Result<SellOffer> {
    test_support::sell_offer(pool, mint_hash, quantity, price).await
}

async fn snapshot(pool: &SqlitePool, mint_hash: &str) -> BalanceSnapshot {
    ledger::balance_snapshot(pool, OWNER, mint_hash).await.unwrap()
}

#[tokio::test]
async fn test_sell_offer_scenario() {
    let pool = test_support::pool().await;
    let mint_hash = setup(&pool).await;
    let settled = ledger::token_balance(&pool, OWNER, &mint_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.quantity, 1000);

    // Hold 900 for a confirmed invoice so 100 remains spendable.
    let (_, row) = test_support::announced_invoice(&pool, &mint_hash, 900, 20).await;
    invoices::try_confirm(&pool, &row).await.unwrap();
    assert_eq!(snapshot(&pool, &mint_hash).await.available(), 100);

    let err = offer(&pool, &mint_hash, 150, 1).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientBalance {
            requested: 150,
            available: 100
        }
    ));

    offer(&pool, &mint_hash, 80, 1).await.unwrap();
    assert_eq!(snapshot(&pool, &mint_hash).await.available(), 20);

    let err = offer(&pool, &mint_hash, 30, 1).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { available: 20, .. }));

    offer(&pool, &mint_hash, 20, 1).await.unwrap();
    let after = snapshot(&pool, &mint_hash).await;
    assert_eq!(after.available(), 0);
    assert_eq!(after.settled, after.available() + after.pending + after.offered);
    assert_eq!((after.pending, after.offered), (900, 100));
}

#[tokio::test]
async fn test_withdrawing_an_offer_frees_balance() {
    let pool = test_support::pool().await;
    let mint_hash = setup(&pool).await;
    let placed = offer(&pool, &mint_hash, 400, 3).await.unwrap();
    assert_eq!(snapshot(&pool, &mint_hash).await.available(), 600);

    let (gossip, mut rx) = test_support::publisher();
    let err = offers::delete_offer(&pool, &gossip, OfferSide::Sell, withdrawal(&key(31), &placed.hash))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert_eq!(snapshot(&pool, &mint_hash).await.offered, 400);

    offers::delete_offer(&pool, &gossip, OfferSide::Sell, withdrawal(&test_support::offer_signer(), &placed.hash))
        .await
        .unwrap();
    assert_eq!(snapshot(&pool, &mint_hash).await.available(), 1000);
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_invoice_cannot_reserve_offered_tokens() {
    let pool = test_support::pool().await;
    let mint_hash = setup(&pool).await;
    let placed = offer(&pool, &mint_hash, 1000, 5).await.unwrap();
    let (invoice_hash, row) = test_support::announced_invoice(&pool, &mint_hash, 1000, 20).await;

    let err = invoices::try_confirm(&pool, &row).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientBalance {
            requested: 1000,
            available: 0
        }
    ));
    let held = snapshot(&pool, &mint_hash).await;
    assert_eq!((held.pending, held.offered, held.available()), (0, 1000, 0));
    assert!(invoices::get_unconfirmed_invoice(&pool, &invoice_hash)
        .await
        .unwrap()
        .is_some());
    assert!(db::get_onchain_transaction(&pool, &row.id).await.unwrap().is_some());

    // Withdrawing the offer lets the deferred row confirm.
    let (gossip, _rx) = test_support::publisher();
    offers::delete_offer(
        &pool,
        &gossip,
        OfferSide::Sell,
        withdrawal(&test_support::offer_signer(), &placed.hash),
    )
    .await
    .unwrap();
    assert!(matches!(
        invoices::try_confirm(&pool, &row).await.unwrap(),
        Confirmation::Confirmed(_)
    ));
    let after = snapshot(&pool, &mint_hash).await;
    assert_eq!((after.pending, after.offered, after.available()), (1000, 0, 0));
}

#[tokio::test]
async fn test_reservations_do_not_exceed_settled_balance() {
    let pool = test_support::pool().await;
    let mint_hash = setup(&pool).await;
    let (_, first) = test_support::announced_invoice(&pool, &mint_hash, 700, 20).await;
    let (second_hash, second) = test_support::announced_invoice(&pool, &mint_hash, 400, 21).await;

    invoices::try_confirm(&pool, &first).await.unwrap();
    let err = invoices::try_confirm(&pool, &second).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientBalance {
            requested: 400,
            available: 300
        }
    ));
    // Rolled back: the proposal and its row survive for a later attempt.
    assert!(invoices::get_unconfirmed_invoice(&pool, &second_hash)
        .await
        .unwrap()
        .is_some());
    assert!(invoices::get_invoice(&pool, &second_hash).await.unwrap().is_none());
    assert_eq!(snapshot(&pool, &mint_hash).await.pending, 700);
}

#[tokio::test]
async fn test_concurrent_offers_never_oversell() {
    let pool = test_support::file_pool().await;
    let mint_hash = setup(&pool).await;

    let mut handles = Vec::new();
    for price in 0..25 {
        let pool = pool.clone();
        let mint_hash = mint_hash.clone();
        handles.push(tokio::spawn(async move {
            offer(&pool, &mint_hash, 100, price).await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(offer) => accepted += offer.terms.quantity,
            Err(EngineError::InsufficientBalance { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let after = snapshot(&pool, &mint_hash).await;
    assert_eq!(accepted, 1000);
    assert_eq!(after.offered, accepted);
    assert_eq!(after.available(), 0);
    assert_eq!(after.settled, after.available() + after.pending + after.offered);
}
