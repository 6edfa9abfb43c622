//! Periodic sweep that bounds store growth: invoice timeouts, surplus
//! unconfirmed mints and settled on-chain rows.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::ChainNode;
use crate::config::RetentionPolicy;
use crate::db;
use crate::errors::Result;
use crate::invoices;
use crate::mints;
use crate::models::now_unix;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub unconfirmed_invoices_expired: u64,
    pub confirmed_invoices_expired: u64,
    pub unconfirmed_mints_trimmed: u64,
    pub onchain_transactions_trimmed: u64,
}

/// Run every step once against chain height `tip`. A failing step is logged
/// and the remaining steps still run.
pub async fn sweep(pool: &SqlitePool, policy: &RetentionPolicy, tip: i64) -> SweepReport {
    let mut report = sweep_without_tip(pool, policy).await;
    report.confirmed_invoices_expired = logged(
        "expire confirmed invoices",
        invoices::expire_confirmed_invoices(pool, tip - policy.invoice_timeout_blocks).await,
    );
    report.onchain_transactions_trimmed = logged(
        "trim on-chain transactions",
        db::trim_onchain_transactions_below(pool, tip - policy.blocks_to_keep).await,
    );
    report
}

/// The steps that do not depend on chain height.
pub async fn sweep_without_tip(pool: &SqlitePool, policy: &RetentionPolicy) -> SweepReport {
    let ttl = i64::try_from(policy.unconfirmed_invoice_ttl.as_secs()).unwrap_or(i64::MAX);
    SweepReport {
        unconfirmed_invoices_expired: logged(
            "expire unconfirmed invoices",
            invoices::expire_unconfirmed_invoices(pool, now_unix().saturating_sub(ttl)).await,
        ),
        unconfirmed_mints_trimmed: logged(
            "trim unconfirmed mints",
            mints::trim_unconfirmed_mints(pool, policy.unconfirmed_mints_to_keep).await,
        ),
        ..SweepReport::default()
    }
}

fn logged(step: &str, outcome: Result<u64>) -> u64 {
    outcome.unwrap_or_else(|e| {
        error!("Retention step '{step}' failed: {e}");
        0
    })
}

/// Sweep every `interval` until cancelled.
pub async fn run(
    pool: SqlitePool,
    chain: Arc<dyn ChainNode>,
    policy: RetentionPolicy,
    interval: Duration,
    token: CancellationToken,
) {
    info!("Retention sweep starting (every {}s)", interval.as_secs());
    loop {
        let report = match chain.best_block_height().await {
            Ok(tip) => sweep(&pool, &policy, tip).await,
            Err(e) => {
                warn!("Chain tip unavailable, height-based retention skipped: {e}");
                sweep_without_tip(&pool, &policy).await
            }
        };
        if report != SweepReport::default() {
            info!(?report, "Retention sweep removed rows");
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Retention sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        new_id, InvoiceStatus, SignatureRequirementType, UnconfirmedInvoice, UnconfirmedMint,
    };
    use crate::protocol::ActionType;
    use crate::test_support::{self, key, FixedTip, NoChain};

    #[tokio::test]
    async fn trims_onchain_rows_below_cutoff_only() {
        let pool = test_support::pool().await;
        for height in [80, 89, 90, 120] {
            let tx = test_support::onchain(ActionType::Mint, vec![0; 32], height, 0);
            db::insert_onchain_transaction(&pool, &tx).await.unwrap();
        }
        let policy = RetentionPolicy {
            blocks_to_keep: 10,
            ..RetentionPolicy::default()
        };
        let report = sweep(&pool, &policy, 100).await;
        assert_eq!(report.onchain_transactions_trimmed, 2);

        let heights: Vec<(i64,)> =
            sqlx::query_as("SELECT block_height FROM onchain_transactions ORDER BY block_height")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(heights, vec![(90,), (120,)]);
    }

    #[tokio::test]
    async fn keeps_newest_unconfirmed_mints() {
        let pool = test_support::pool().await;
        for i in 0..4 {
            let mut terms =
                test_support::mint_terms(&key(1), SignatureRequirementType::None, &[], 0);
            terms.fraction_count = 10 + i;
            let mut mint = UnconfirmedMint::new(terms, "owner".to_string(), String::new()).unwrap();
            mint.created_at = 500 + i;
            mints::insert_unconfirmed_mint(&pool, &mint).await.unwrap();
        }
        let policy = RetentionPolicy {
            unconfirmed_mints_to_keep: 3,
            ..RetentionPolicy::default()
        };
        let report = sweep(&pool, &policy, 0).await;
        assert_eq!(report.unconfirmed_mints_trimmed, 1);
        let (oldest,): (i64,) = sqlx::query_as("SELECT MIN(created_at) FROM unconfirmed_mints")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(oldest, 501);
    }

    #[tokio::test]
    async fn stale_unconfirmed_invoices_are_deleted() {
        let pool = test_support::pool().await;
        for (i, age) in [(1, 10), (2, 100_000)] {
            let terms = test_support::invoice_terms(&key(9), &"aa".repeat(32), i);
            let created_at = now_unix() - age;
            let invoice = UnconfirmedInvoice {
                id: new_id(),
                hash: UnconfirmedInvoice::content_hash(&terms, created_at).unwrap(),
                terms,
                signature: String::new(),
                status: InvoiceStatus::Draft,
                created_at,
            };
            invoices::insert_unconfirmed_invoice(&pool, &invoice).await.unwrap();
        }
        let report = sweep(&pool, &RetentionPolicy::default(), 0).await;
        assert_eq!(report.unconfirmed_invoices_expired, 1);
        assert_eq!(db::table_counts(&pool).await.unwrap().unconfirmed_invoices, 1);
    }

    #[tokio::test]
    async fn loop_sweeps_then_stops_on_cancel() {
        let pool = test_support::pool().await;
        let tx = test_support::onchain(ActionType::Mint, vec![0; 32], 1, 0);
        db::insert_onchain_transaction(&pool, &tx).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        run(
            pool.clone(),
            Arc::new(FixedTip(1_000)),
            RetentionPolicy::default(),
            Duration::from_secs(3600),
            token,
        )
        .await;
        assert_eq!(db::table_counts(&pool).await.unwrap().onchain_transactions, 0);
    }

    #[tokio::test]
    async fn loop_still_trims_proposals_without_chain_tip() {
        let pool = test_support::pool().await;
        let tx = test_support::onchain(ActionType::Mint, vec![0; 32], 1, 0);
        db::insert_onchain_transaction(&pool, &tx).await.unwrap();
        for i in 0..2 {
            let mut terms =
                test_support::mint_terms(&key(1), SignatureRequirementType::None, &[], 0);
            terms.fraction_count = 10 + i;
            let mint = UnconfirmedMint::new(terms, "owner".to_string(), String::new()).unwrap();
            mints::insert_unconfirmed_mint(&pool, &mint).await.unwrap();
        }

        let token = CancellationToken::new();
        token.cancel();
        let policy = RetentionPolicy {
            unconfirmed_mints_to_keep: 1,
            ..RetentionPolicy::default()
        };
        run(pool.clone(), Arc::new(NoChain), policy, Duration::from_secs(3600), token).await;

        let counts = db::table_counts(&pool).await.unwrap();
        assert_eq!(counts.unconfirmed_mints, 1);
        assert_eq!(counts.onchain_transactions, 1);
    }
}
