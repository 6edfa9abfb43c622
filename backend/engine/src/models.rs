//! Records owned by the store: mints, invoices, signatures, offers, balances
//! and on-chain transaction rows.
//!
//! Mints, invoices and offers carry a content hash: the SHA-256 of a domain
//! tag plus the canonical JSON of their terms. Peers recompute it on receipt,
//! and confirmation matching is keyed on it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::crypto;
use crate::errors::{EngineError, Result};
use crate::protocol::ActionType;

const MINT_TAG: &[u8] = b"tokenisation:mint:v1:";
const INVOICE_TAG: &[u8] = b"tokenisation:invoice:v1:";
const INVOICE_APPROVAL_TAG: &[u8] = b"tokenisation:invoice-approval:v1:";
const SELL_OFFER_TAG: &[u8] = b"tokenisation:sell-offer:v1:";
const BUY_OFFER_TAG: &[u8] = b"tokenisation:buy-offer:v1:";
const DELETE_OFFER_TAG: &[u8] = b"tokenisation:delete-offer:v1:";
const INVOICE_TERMS_TAG: &[u8] = b"tokenisation:invoice-terms:v1:";
const SELL_OFFER_TERMS_TAG: &[u8] = b"tokenisation:sell-offer-terms:v1:";
const BUY_OFFER_TERMS_TAG: &[u8] = b"tokenisation:buy-offer-terms:v1:";

pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `tag || canonical JSON`: what a creator signs before the record exists.
fn signing_payload<T: Serialize>(tag: &[u8], terms: &T) -> Result<Vec<u8>> {
    let mut payload = tag.to_vec();
    serde_json::to_writer(&mut payload, terms)?;
    Ok(payload)
}

// ─────────────────────────────────────────────────────────
// Signature policy
// ─────────────────────────────────────────────────────────

/// How many asset-manager approvals an invoice against a mint needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureRequirementType {
    #[default]
    None,
    OneSignature,
    AllSignatures,
    MinSignatures,
}

impl SignatureRequirementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::OneSignature => "ONE_SIGNATURE",
            Self::AllSignatures => "ALL_SIGNATURES",
            Self::MinSignatures => "MIN_SIGNATURES",
        }
    }

    /// An empty string is an unset policy and reads as `NONE`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "" | "NONE" => Ok(Self::None),
            "ONE_SIGNATURE" => Ok(Self::OneSignature),
            "ALL_SIGNATURES" => Ok(Self::AllSignatures),
            "MIN_SIGNATURES" => Ok(Self::MinSignatures),
            other => Err(EngineError::Validation(format!(
                "unknown signature requirement type: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for SignatureRequirementType {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManager {
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub url: String,
}

// ─────────────────────────────────────────────────────────
// Mints
// ─────────────────────────────────────────────────────────

/// Everything a proposer chooses about a mint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MintTerms {
    pub title: String,
    pub description: String,
    pub fraction_count: i64,
    #[sqlx(json)]
    #[serde(default)]
    pub tags: Vec<String>,
    #[sqlx(json)]
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub feed_url: String,
    pub public_key: String,
    #[sqlx(try_from = "String")]
    #[serde(default)]
    pub signature_requirement_type: SignatureRequirementType,
    #[sqlx(json)]
    #[serde(default)]
    pub asset_managers: Vec<AssetManager>,
    #[serde(default)]
    pub min_signatures: i64,
}

impl MintTerms {
    pub fn content_hash(&self, owner_address: &str) -> Result<String> {
        let body = serde_json::to_vec(&(owner_address, self))?;
        Ok(crypto::content_hash(MINT_TAG, &body))
    }

    pub fn is_registered_manager(&self, public_key: &str) -> bool {
        self.asset_managers
            .iter()
            .any(|m| m.public_key.eq_ignore_ascii_case(public_key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UnconfirmedMint {
    pub id: String,
    pub hash: String,
    pub owner_address: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub terms: MintTerms,
    /// Proposer's signature over the mint hash.
    pub signature: String,
    pub created_at: i64,
}

impl UnconfirmedMint {
    pub fn new(terms: MintTerms, owner_address: String, signature: String) -> Result<Self> {
        Ok(Self {
            id: new_id(),
            hash: terms.content_hash(&owner_address)?,
            owner_address,
            terms,
            signature,
            created_at: now_unix(),
        })
    }

    pub fn has_valid_hash(&self) -> bool {
        self.terms
            .content_hash(&self.owner_address)
            .map(|h| h == self.hash)
            .unwrap_or(false)
    }
}

/// A mint matched against on-chain evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Mint {
    pub id: String,
    pub hash: String,
    pub owner_address: String,
    pub transaction_hash: String,
    pub block_height: i64,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub terms: MintTerms,
    /// Proposer's signature over the mint hash.
    pub signature: String,
    pub created_at: i64,
}

// ─────────────────────────────────────────────────────────
// Invoices
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    PendingSignatures,
    Confirmed,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingSignatures => "pending_signatures",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
        }
    }

    /// Status a freshly created invoice starts in under `policy`.
    pub fn initial_for(policy: SignatureRequirementType) -> Self {
        match policy {
            SignatureRequirementType::None => Self::Draft,
            _ => Self::PendingSignatures,
        }
    }
}

impl TryFrom<String> for InvoiceStatus {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "draft" => Ok(Self::Draft),
            "pending_signatures" => Ok(Self::PendingSignatures),
            "confirmed" => Ok(Self::Confirmed),
            "expired" => Ok(Self::Expired),
            other => Err(EngineError::Validation(format!("unknown invoice status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct InvoiceTerms {
    pub mint_hash: String,
    pub quantity: i64,
    pub price: i64,
    pub buyer_address: String,
    pub seller_address: String,
    pub payment_address: String,
    /// Key of the party that created the invoice.
    pub public_key: String,
}

impl InvoiceTerms {
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        signing_payload(INVOICE_TERMS_TAG, self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UnconfirmedInvoice {
    pub id: String,
    pub hash: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub terms: InvoiceTerms,
    /// Creator's signature over [`InvoiceTerms::signing_payload`].
    pub signature: String,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub created_at: i64,
}

impl UnconfirmedInvoice {
    pub fn content_hash(terms: &InvoiceTerms, created_at: i64) -> Result<String> {
        let body = serde_json::to_vec(&(terms, created_at))?;
        Ok(crypto::content_hash(INVOICE_TAG, &body))
    }

    pub fn has_valid_hash(&self) -> bool {
        Self::content_hash(&self.terms, self.created_at)
            .map(|h| h == self.hash)
            .unwrap_or(false)
    }

    /// Bytes an asset manager signs to approve this exact invoice body.
    pub fn approval_payload(&self) -> Vec<u8> {
        let t = &self.terms;
        let quantity = t.quantity.to_string();
        let price = t.price.to_string();
        let mut payload = Vec::with_capacity(256);
        payload.extend_from_slice(INVOICE_APPROVAL_TAG);
        for field in [
            self.hash.as_str(),
            t.mint_hash.as_str(),
            quantity.as_str(),
            price.as_str(),
            t.buyer_address.as_str(),
            t.seller_address.as_str(),
            t.payment_address.as_str(),
        ] {
            payload.extend_from_slice(field.as_bytes());
            payload.push(0);
        }
        payload
    }
}

/// An invoice matched on-chain with its policy satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: String,
    pub hash: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub terms: InvoiceTerms,
    pub signature: String,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub block_height: i64,
    pub transaction_hash: String,
    pub created_at: i64,
    pub confirmed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct InvoiceSignature {
    pub id: String,
    pub invoice_hash: String,
    pub public_key: String,
    pub signature: String,
    pub created_at: i64,
}

impl InvoiceSignature {
    pub fn new(invoice_hash: String, public_key: String, signature: String) -> Self {
        Self {
            id: new_id(),
            invoice_hash,
            public_key,
            signature,
            created_at: now_unix(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Offers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SellOfferTerms {
    pub mint_hash: String,
    pub offerer_address: String,
    pub quantity: i64,
    pub price: i64,
    pub public_key: String,
}

impl SellOfferTerms {
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        signing_payload(SELL_OFFER_TERMS_TAG, self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SellOffer {
    pub id: String,
    pub hash: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub terms: SellOfferTerms,
    pub signature: String,
    pub created_at: i64,
}

impl SellOffer {
    pub fn content_hash(terms: &SellOfferTerms, created_at: i64) -> Result<String> {
        let body = serde_json::to_vec(&(terms, created_at))?;
        Ok(crypto::content_hash(SELL_OFFER_TAG, &body))
    }

    pub fn has_valid_hash(&self) -> bool {
        Self::content_hash(&self.terms, self.created_at)
            .map(|h| h == self.hash)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BuyOfferTerms {
    pub mint_hash: String,
    pub offerer_address: String,
    pub seller_address: String,
    pub quantity: i64,
    pub price: i64,
    pub public_key: String,
}

impl BuyOfferTerms {
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        signing_payload(BUY_OFFER_TERMS_TAG, self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BuyOffer {
    pub id: String,
    pub hash: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub terms: BuyOfferTerms,
    pub signature: String,
    pub created_at: i64,
}

impl BuyOffer {
    pub fn content_hash(terms: &BuyOfferTerms, created_at: i64) -> Result<String> {
        let body = serde_json::to_vec(&(terms, created_at))?;
        Ok(crypto::content_hash(BUY_OFFER_TAG, &body))
    }

    pub fn has_valid_hash(&self) -> bool {
        Self::content_hash(&self.terms, self.created_at)
            .map(|h| h == self.hash)
            .unwrap_or(false)
    }
}

/// Returned to a proposer: the record hash plus the hex envelope to embed in
/// the transaction they broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposalReceipt {
    pub hash: String,
    pub encoded_transaction_body: String,
}

/// Bytes an offer owner signs to withdraw the offer with `hash`.
pub fn delete_offer_payload(hash: &str) -> Vec<u8> {
    let mut payload = DELETE_OFFER_TAG.to_vec();
    payload.extend_from_slice(hash.as_bytes());
    payload
}

// ─────────────────────────────────────────────────────────
// Ledger rows
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TokenBalance {
    pub address: String,
    pub mint_hash: String,
    pub quantity: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PendingTokenBalance {
    pub invoice_hash: String,
    pub mint_hash: String,
    pub quantity: i64,
    pub owner_address: String,
    pub created_at: i64,
}

// ─────────────────────────────────────────────────────────
// On-chain evidence
// ─────────────────────────────────────────────────────────

/// A scanned transaction whose data output carried a tokenisation envelope.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OnChainTransaction {
    pub id: String,
    pub tx_hash: String,
    pub block_height: i64,
    pub block_hash: String,
    pub tx_index: i64,
    #[sqlx(try_from = "i64")]
    pub action_type: ActionType,
    #[sqlx(try_from = "i64")]
    pub action_version: u8,
    pub action_payload: Vec<u8>,
    /// Sender of the transaction.
    pub address: String,
    #[sqlx(json)]
    pub values: BTreeMap<String, serde_json::Value>,
    pub created_at: i64,
}

/// What a confirmation pipeline did with one on-chain row.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation<T> {
    Confirmed(T),
    /// The payload does not describe the stored record; nothing changed.
    Mismatch,
}
