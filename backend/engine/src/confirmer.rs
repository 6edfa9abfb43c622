//! Long-running background tasks that page through stored on-chain rows and
//! drive them through the mint and invoice confirmation pipelines.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{self, OnChainCursor};
use crate::errors::{EngineError, Result};
use crate::invoices;
use crate::mints;
use crate::models::{Confirmation, OnChainTransaction};
use crate::protocol::ActionType;

pub struct ConfirmerState {
    pub pool: SqlitePool,
    pub poll_interval: Duration,
    pub batch_size: u32,
}

/// Which pipeline a loop drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Mint,
    Invoice,
}

impl Pipeline {
    pub fn action_type(self) -> ActionType {
        match self {
            Self::Mint => ActionType::Mint,
            Self::Invoice => ActionType::Invoice,
        }
    }
}

/// Per-tick tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub duplicates: usize,
    /// Rows left in place for a later tick.
    pub deferred: usize,
    /// Rows that cannot be decoded or are otherwise unusable.
    pub skipped: usize,
}

enum RowOutcome {
    Confirmed,
    Duplicate,
    Deferred,
    Skipped,
}

/// Run one pipeline loop until `token` is cancelled.
pub async fn run(state: Arc<ConfirmerState>, pipeline: Pipeline, token: CancellationToken) {
    info!(
        "{:?} confirmer starting (every {}s, batch {})",
        pipeline,
        state.poll_interval.as_secs(),
        state.batch_size
    );

    loop {
        match poll_once(&state.pool, pipeline, state.batch_size).await {
            Ok(report) if report.confirmed > 0 || report.duplicates > 0 => {
                info!(
                    ?pipeline,
                    scanned = report.scanned,
                    confirmed = report.confirmed,
                    duplicates = report.duplicates,
                    deferred = report.deferred,
                    skipped = report.skipped,
                    "Confirmation tick finished"
                );
            }
            Ok(report) => debug!(?pipeline, scanned = report.scanned, "Nothing confirmed"),
            Err(e) => error!("{pipeline:?} confirmer tick aborted: {e}"),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(state.poll_interval) => {}
        }
    }
    info!("{pipeline:?} confirmer stopped");
}

/// Page through every stored row of the pipeline's action type once.
///
/// Storage failures end the tick early and are returned; everything else is
/// tallied per row.
pub async fn poll_once(pool: &SqlitePool, pipeline: Pipeline, batch_size: u32) -> Result<TickReport> {
    let mut report = TickReport::default();
    let mut cursor = OnChainCursor::start();
    let batch_size = batch_size.max(1);

    loop {
        let page =
            db::list_onchain_transactions(pool, pipeline.action_type(), &cursor, batch_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = OnChainCursor::after(last);

        for row in &page {
            report.scanned += 1;
            match process_row(pool, pipeline, row).await? {
                RowOutcome::Confirmed => report.confirmed += 1,
                RowOutcome::Duplicate => report.duplicates += 1,
                RowOutcome::Deferred => report.deferred += 1,
                RowOutcome::Skipped => report.skipped += 1,
            }
        }

        if page.len() < batch_size as usize {
            break;
        }
    }
    Ok(report)
}

async fn process_row(
    pool: &SqlitePool,
    pipeline: Pipeline,
    row: &OnChainTransaction,
) -> Result<RowOutcome> {
    let outcome = match pipeline {
        Pipeline::Mint => {
            if mints::match_confirmed_mint(pool, row).await? {
                return Ok(RowOutcome::Duplicate);
            }
            mints::try_confirm(pool, row).await.map(|c| matches!(c, Confirmation::Confirmed(_)))
        }
        Pipeline::Invoice => invoices::try_confirm(pool, row)
            .await
            .map(|c| matches!(c, Confirmation::Confirmed(_))),
    };

    match outcome {
        Ok(true) => Ok(RowOutcome::Confirmed),
        Ok(false) => {
            debug!(id = %row.id, tx_hash = %row.tx_hash, "On-chain row does not match its proposal");
            Ok(RowOutcome::Deferred)
        }
        Err(e) if e.is_retryable() => {
            debug!(id = %row.id, "Confirmation deferred: {e}");
            Ok(RowOutcome::Deferred)
        }
        Err(e @ (EngineError::Decode(_) | EngineError::Validation(_))) => {
            warn!(id = %row.id, tx_hash = %row.tx_hash, "Skipping on-chain row: {e}");
            Ok(RowOutcome::Skipped)
        }
        Err(e) => Err(e),
    }
}
