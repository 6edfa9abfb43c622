//! Outbound gossip of new unconfirmed records, and validation of records
//! received from peers.
//!
//! Engine operations hand messages to a [`GossipPublisher`]. It queues them
//! on a bounded channel; [`run_publisher`] drains the queue into whichever
//! [`GossipClient`] is configured. Delivery is best effort: a full queue
//! drops the message, and nothing in the engine waits on a peer.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::errors::{EngineError, Result};
use crate::invoices;
use crate::ledger;
use crate::mints;
use crate::models::{
    BuyOffer, InvoiceSignature, InvoiceStatus, SellOffer, UnconfirmedInvoice, UnconfirmedMint,
};
use crate::offers::{self, OfferDeletion, OfferSide};
use crate::policy;

/// Record announcements exchanged with peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GossipMessage {
    Mint(UnconfirmedMint),
    Invoice(UnconfirmedInvoice),
    InvoiceSignature(InvoiceSignature),
    SellOffer(SellOffer),
    BuyOffer(BuyOffer),
    DeleteSellOffer(OfferDeletion),
    DeleteBuyOffer(OfferDeletion),
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mint(_) => "mint",
            Self::Invoice(_) => "invoice",
            Self::InvoiceSignature(_) => "invoice_signature",
            Self::SellOffer(_) => "sell_offer",
            Self::BuyOffer(_) => "buy_offer",
            Self::DeleteSellOffer(_) => "delete_sell_offer",
            Self::DeleteBuyOffer(_) => "delete_buy_offer",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait GossipClient: Send + Sync {
    async fn publish_mint(&self, mint: &UnconfirmedMint) -> Result<()>;
    async fn publish_invoice(&self, invoice: &UnconfirmedInvoice) -> Result<()>;
    async fn publish_signature(&self, signature: &InvoiceSignature) -> Result<()>;
    async fn publish_sell_offer(&self, offer: &SellOffer) -> Result<()>;
    async fn publish_buy_offer(&self, offer: &BuyOffer) -> Result<()>;
    async fn publish_offer_deletion(&self, side: OfferSide, deletion: &OfferDeletion)
        -> Result<()>;
}

async fn dispatch(client: &dyn GossipClient, message: &GossipMessage) -> Result<()> {
    match message {
        GossipMessage::Mint(m) => client.publish_mint(m).await,
        GossipMessage::Invoice(i) => client.publish_invoice(i).await,
        GossipMessage::InvoiceSignature(s) => client.publish_signature(s).await,
        GossipMessage::SellOffer(o) => client.publish_sell_offer(o).await,
        GossipMessage::BuyOffer(o) => client.publish_buy_offer(o).await,
        GossipMessage::DeleteSellOffer(d) => client.publish_offer_deletion(OfferSide::Sell, d).await,
        GossipMessage::DeleteBuyOffer(d) => client.publish_offer_deletion(OfferSide::Buy, d).await,
    }
}

/// Cheap, cloneable handle the engine publishes through.
#[derive(Debug, Clone)]
pub struct GossipPublisher {
    tx: mpsc::Sender<GossipMessage>,
}

impl GossipPublisher {
    pub fn new(tx: mpsc::Sender<GossipMessage>) -> Self {
        Self { tx }
    }

    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<GossipMessage>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self::new(tx), rx)
    }

    /// Queue `message` without waiting.
    pub fn publish(&self, message: GossipMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(kind = message.kind(), "Gossip queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                warn!(kind = message.kind(), "Gossip publisher stopped, dropping message");
            }
        }
    }
}

/// Drain the publish queue into `client` until cancelled.
pub async fn run_publisher(
    mut rx: mpsc::Receiver<GossipMessage>,
    client: Arc<dyn GossipClient>,
    token: CancellationToken,
) {
    info!("Gossip publisher starting");
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = dispatch(client.as_ref(), &message).await {
            warn!(kind = message.kind(), "Gossip publish failed: {e}");
        }
    }
    info!("Gossip publisher stopped");
}

/// Posts every message as JSON to `{relay_url}/gossip`.
pub struct HttpGossipClient {
    client: Client,
    endpoint: String,
}

impl HttpGossipClient {
    pub fn new(client: Client, relay_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/gossip", relay_url.trim_end_matches('/')),
        }
    }

    async fn post(&self, message: &GossipMessage) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        debug!(kind = message.kind(), "Gossip delivered to relay");
        Ok(())
    }
}

#[async_trait]
impl GossipClient for HttpGossipClient {
    async fn publish_mint(&self, mint: &UnconfirmedMint) -> Result<()> {
        self.post(&GossipMessage::Mint(mint.clone())).await
    }

    async fn publish_invoice(&self, invoice: &UnconfirmedInvoice) -> Result<()> {
        self.post(&GossipMessage::Invoice(invoice.clone())).await
    }

    async fn publish_signature(&self, signature: &InvoiceSignature) -> Result<()> {
        self.post(&GossipMessage::InvoiceSignature(signature.clone())).await
    }

    async fn publish_sell_offer(&self, offer: &SellOffer) -> Result<()> {
        self.post(&GossipMessage::SellOffer(offer.clone())).await
    }

    async fn publish_buy_offer(&self, offer: &BuyOffer) -> Result<()> {
        self.post(&GossipMessage::BuyOffer(offer.clone())).await
    }

    async fn publish_offer_deletion(
        &self,
        side: OfferSide,
        deletion: &OfferDeletion,
    ) -> Result<()> {
        let message = match side {
            OfferSide::Sell => GossipMessage::DeleteSellOffer(deletion.clone()),
            OfferSide::Buy => GossipMessage::DeleteBuyOffer(deletion.clone()),
        };
        self.post(&message).await
    }
}

/// Used when no relay is configured.
pub struct LogGossipClient;

#[async_trait]
impl GossipClient for LogGossipClient {
    async fn publish_mint(&self, mint: &UnconfirmedMint) -> Result<()> {
        info!(hash = %mint.hash, "gossip: mint");
        Ok(())
    }

    async fn publish_invoice(&self, invoice: &UnconfirmedInvoice) -> Result<()> {
        info!(hash = %invoice.hash, "gossip: invoice");
        Ok(())
    }

    async fn publish_signature(&self, signature: &InvoiceSignature) -> Result<()> {
        info!(
            invoice_hash = %signature.invoice_hash,
            public_key = %signature.public_key,
            "gossip: invoice signature"
        );
        Ok(())
    }

    async fn publish_sell_offer(&self, offer: &SellOffer) -> Result<()> {
        info!(hash = %offer.hash, "gossip: sell offer");
        Ok(())
    }

    async fn publish_buy_offer(&self, offer: &BuyOffer) -> Result<()> {
        info!(hash = %offer.hash, "gossip: buy offer");
        Ok(())
    }

    async fn publish_offer_deletion(
        &self,
        side: OfferSide,
        deletion: &OfferDeletion,
    ) -> Result<()> {
        info!(hash = %deletion.hash, side = side.as_str(), "gossip: offer deletion");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────

/// Validate a peer's record and store it if new. Returns whether anything
/// was written. Peer records never confirm anything.
pub async fn accept_gossip(pool: &SqlitePool, message: GossipMessage) -> Result<bool> {
    let kind = message.kind();
    let stored = match message {
        GossipMessage::Mint(mint) => {
            if !mint.has_valid_hash() {
                return Err(hash_mismatch(kind, &mint.hash));
            }
            crypto::verify(&mint.terms.public_key, &mint.signature, mint.hash.as_bytes())?;
            mints::validate_terms(&mint.terms)?;
            mints::insert_unconfirmed_mint(pool, &mint).await?
        }
        GossipMessage::Invoice(invoice) => {
            if !invoice.has_valid_hash() {
                return Err(hash_mismatch(kind, &invoice.hash));
            }
            crypto::verify(
                &invoice.terms.public_key,
                &invoice.signature,
                &invoice.terms.signing_payload()?,
            )?;
            if !matches!(
                invoice.status,
                InvoiceStatus::Draft | InvoiceStatus::PendingSignatures
            ) {
                return Err(EngineError::Validation(format!(
                    "peer invoice {} has status {}",
                    invoice.hash,
                    invoice.status.as_str()
                )));
            }
            let mint = mints::get_mint(pool, &invoice.terms.mint_hash)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("mint {}", invoice.terms.mint_hash))
                })?;
            policy::required_signatures(&mint.terms)?;
            invoices::insert_unconfirmed_invoice(pool, &invoice).await?
        }
        GossipMessage::InvoiceSignature(signature) => {
            let invoice = invoices::get_unconfirmed_invoice(pool, &signature.invoice_hash)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("invoice {}", signature.invoice_hash))
                })?;
            crypto::verify(
                &signature.public_key,
                &signature.signature,
                &invoice.approval_payload(),
            )?;
            invoices::record_signature(pool, &invoice, &signature).await?
        }
        GossipMessage::SellOffer(offer) => {
            if !offer.has_valid_hash() {
                return Err(hash_mismatch(kind, &offer.hash));
            }
            crypto::verify(
                &offer.terms.public_key,
                &offer.signature,
                &offer.terms.signing_payload()?,
            )?;
            if offers::sell_offer_exists(pool, &offer.hash).await? {
                false
            } else {
                let mut conn = pool.acquire().await?;
                ledger::insert_sell_offer_if_covered(&mut conn, &offer).await?;
                true
            }
        }
        GossipMessage::BuyOffer(offer) => {
            if !offer.has_valid_hash() {
                return Err(hash_mismatch(kind, &offer.hash));
            }
            crypto::verify(
                &offer.terms.public_key,
                &offer.signature,
                &offer.terms.signing_payload()?,
            )?;
            offers::insert_buy_offer(pool, &offer).await?
        }
        GossipMessage::DeleteSellOffer(deletion) => {
            offers::remove_offer(pool, OfferSide::Sell, &deletion).await?
        }
        GossipMessage::DeleteBuyOffer(deletion) => {
            offers::remove_offer(pool, OfferSide::Buy, &deletion).await?
        }
    };
    debug!(kind, stored, "Accepted gossip");
    Ok(stored)
}

fn hash_mismatch(kind: &str, hash: &str) -> EngineError {
    EngineError::Validation(format!("{kind} {hash} does not match its content hash"))
}
