//! Shared fixtures for unit and scenario tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::chain::ChainNode;
use crate::config::OfferLimits;
use crate::db;
use crate::errors::{EngineError, Result};
use crate::gossip::{GossipMessage, GossipPublisher};
use crate::invoices;
use crate::mints;
use crate::models::{
    delete_offer_payload, new_id, now_unix, AssetManager, Confirmation, InvoiceTerms, MintTerms,
    OnChainTransaction, SellOffer, SellOfferTerms, SignatureRequirementType,
};
use crate::offers::{self, OfferDeletion};
use crate::protocol::{self, ActionType, Envelope, MintAction};

/// Fresh in-memory database with migrations applied. A single long-lived
/// connection keeps every query on the same in-memory file.
pub async fn pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    db::MIGRATOR.run(&pool).await.expect("migrations");
    pool
}

/// File-backed database in the temp dir, for tests that race several
/// connections against each other.
pub async fn file_pool() -> SqlitePool {
    let path = std::env::temp_dir().join(format!("tokenisation-test-{}.db", new_id()));
    db::init_pool(&format!("sqlite:{}", path.display()))
        .await
        .expect("file-backed sqlite")
}

pub fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn public_hex(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().as_bytes())
}

pub fn sign_hex(key: &SigningKey, message: &[u8]) -> String {
    hex::encode(key.sign(message).to_bytes())
}

/// Publisher whose queue is never drained; tests inspect it when needed.
pub fn publisher() -> (GossipPublisher, mpsc::Receiver<GossipMessage>) {
    let (tx, rx) = mpsc::channel(64);
    (GossipPublisher::new(tx), rx)
}

pub fn mint_terms(
    proposer: &SigningKey,
    policy: SignatureRequirementType,
    managers: &[&SigningKey],
    min_signatures: i64,
) -> MintTerms {
    MintTerms {
        title: "Warehouse receipt".to_string(),
        description: "Grain lot 7".to_string(),
        fraction_count: 1000,
        tags: vec!["agri".to_string()],
        metadata: serde_json::json!({ "lot": 7 }),
        feed_url: String::new(),
        public_key: public_hex(proposer),
        signature_requirement_type: policy,
        asset_managers: managers
            .iter()
            .enumerate()
            .map(|(i, k)| AssetManager {
                name: format!("manager-{i}"),
                public_key: public_hex(k),
                url: String::new(),
            })
            .collect(),
        min_signatures,
    }
}

pub fn invoice_terms(creator: &SigningKey, mint_hash: &str, quantity: i64) -> InvoiceTerms {
    InvoiceTerms {
        mint_hash: mint_hash.to_string(),
        quantity,
        price: 25,
        buyer_address: "buyer-addr".to_string(),
        seller_address: "seller-addr".to_string(),
        payment_address: "payment-addr".to_string(),
        public_key: public_hex(creator),
    }
}

pub fn onchain(
    action_type: ActionType,
    payload: Vec<u8>,
    block_height: i64,
    tx_index: i64,
) -> OnChainTransaction {
    OnChainTransaction {
        id: new_id(),
        tx_hash: hex::encode([block_height as u8; 32]),
        block_height,
        block_hash: hex::encode([0xbb; 32]),
        tx_index,
        action_type,
        action_version: 1,
        action_payload: payload,
        address: "seller-addr".to_string(),
        values: BTreeMap::new(),
        created_at: now_unix(),
    }
}

/// Propose a mint with `terms` and confirm it at height 10. The owner is the
/// on-chain sender, `seller-addr`.
pub async fn confirmed_mint(pool: &SqlitePool, proposer: &SigningKey, terms: MintTerms) -> String {
    let (gossip, _rx) = publisher();
    let hash = terms.content_hash("owner").unwrap();
    mints::create_mint(pool, &gossip, terms, "owner".to_string(), sign_hex(proposer, hash.as_bytes()))
        .await
        .unwrap();

    let action = MintAction {
        hash: protocol::hash_bytes(&hash).unwrap(),
    };
    let mut tx = onchain(ActionType::Mint, action.encode(), 10, 0);
    tx.tx_hash = hash.clone();
    db::insert_onchain_transaction(pool, &tx).await.unwrap();
    assert!(matches!(
        mints::try_confirm(pool, &tx).await.unwrap(),
        Confirmation::Confirmed(_)
    ));
    hash
}

/// Create an invoice for `quantity` of `mint_hash` and store the matching
/// on-chain announcement at `block_height`. Returns the invoice hash and the
/// stored row.
pub async fn announced_invoice(
    pool: &SqlitePool,
    mint_hash: &str,
    quantity: i64,
    block_height: i64,
) -> (String, OnChainTransaction) {
    let (gossip, _rx) = publisher();
    let creator = key(9);
    let terms = invoice_terms(&creator, mint_hash, quantity);
    let signature = sign_hex(&creator, &terms.signing_payload().unwrap());
    let receipt = invoices::create_invoice(pool, &gossip, &OfferLimits::default(), terms, signature)
        .await
        .unwrap();

    let envelope = Envelope::decode(&hex::decode(&receipt.encoded_transaction_body).unwrap()).unwrap();
    let tx = onchain(ActionType::Invoice, envelope.payload, block_height, 0);
    db::insert_onchain_transaction(pool, &tx).await.unwrap();
    (receipt.hash, tx)
}

/// Key behind every offer placed by [`sell_offer`].
pub fn offer_signer() -> SigningKey {
    key(30)
}

/// Place a signed sell offer by `seller-addr`, with room for many open offers.
pub async fn sell_offer(
    pool: &SqlitePool,
    mint_hash: &str,
    quantity: i64,
    price: i64,
) -> Result<SellOffer> {
    let (gossip, _rx) = publisher();
    let signer = offer_signer();
    let terms = SellOfferTerms {
        mint_hash: mint_hash.to_string(),
        offerer_address: "seller-addr".to_string(),
        quantity,
        price,
        public_key: public_hex(&signer),
    };
    let signature = sign_hex(&signer, &terms.signing_payload()?);
    let limits = OfferLimits {
        sell_offers: 100,
        ..OfferLimits::default()
    };
    offers::create_sell_offer(pool, &gossip, &limits, terms, signature).await
}

pub fn withdrawal(signer: &SigningKey, hash: &str) -> OfferDeletion {
    OfferDeletion {
        hash: hash.to_string(),
        public_key: public_hex(signer),
        signature: sign_hex(signer, &delete_offer_payload(hash)),
    }
}

/// Node stuck at a fixed height on regtest, with a wallet.
pub struct FixedTip(pub i64);

#[async_trait]
impl ChainNode for FixedTip {
    async fn best_block_height(&self) -> Result<i64> {
        Ok(self.0)
    }

    async fn chain_name(&self) -> Result<String> {
        Ok("regtest".to_string())
    }

    async fn wallet_available(&self) -> bool {
        true
    }
}

/// Node that never answers.
pub struct NoChain;

#[async_trait]
impl ChainNode for NoChain {
    async fn best_block_height(&self) -> Result<i64> {
        Err(EngineError::Chain("node offline".to_string()))
    }

    async fn chain_name(&self) -> Result<String> {
        Err(EngineError::Chain("node offline".to_string()))
    }

    async fn wallet_available(&self) -> bool {
        false
    }
}
