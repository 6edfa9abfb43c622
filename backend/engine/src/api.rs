//! Axum REST API handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::OfferLimits;
use crate::db::{self, Page, Paged, TableCounts};
use crate::errors::{EngineError, Result};
use crate::gossip::{self, GossipMessage, GossipPublisher};
use crate::health::{self, HealthStatus};
use crate::invoices::{self, SignatureOutcome};
use crate::ledger;
use crate::mints::{self, MintRecord};
use crate::models::{
    new_id, now_unix, AssetManager, BuyOffer, BuyOfferTerms, Invoice, InvoiceTerms, Mint,
    MintTerms, OnChainTransaction, PendingTokenBalance, ProposalReceipt, SellOffer,
    SellOfferTerms, SignatureRequirementType, TokenBalance,
};
use crate::offers::{self, OfferDeletion, OfferSide};
use crate::protocol::{ActionType, Envelope};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub gossip: GossipPublisher,
    pub limits: OfferLimits,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats", get(stats))
        .route("/mints", get(list_mints).post(create_mint))
        .route("/mints/:hash", get(get_mint))
        .route("/invoices", get(list_invoices).post(create_invoice))
        .route("/invoices/:hash/signatures", post(submit_signature))
        .route("/payments", post(create_payment))
        .route("/balances/:address", get(list_balances))
        .route("/balances/:address/:mint_hash", get(get_balance))
        .route("/pending-balances/:address", get(list_pending_balances))
        .route("/sell-offers", get(list_sell_offers).post(create_sell_offer))
        .route("/sell-offers/:hash", delete(delete_sell_offer))
        .route("/buy-offers", get(list_buy_offers).post(create_buy_offer))
        .route("/buy-offers/:hash", delete(delete_buy_offer))
        .route("/onchain-transactions", post(ingest_onchain_transaction))
        .route("/gossip", post(receive_gossip))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl EngineError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientBalance { .. } | Self::SignaturePolicyUnsatisfied { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn required<T>(field: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| EngineError::Validation(format!("missing field: {field}")))
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateMintRequest {
    pub owner_address: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub fraction_count: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
    pub feed_url: Option<String>,
    pub public_key: Option<String>,
    pub signature_requirement_type: Option<String>,
    pub asset_managers: Option<Vec<AssetManager>>,
    pub min_signatures: Option<i64>,
    /// Proposer's signature over the mint hash.
    pub signature: Option<String>,
}

impl CreateMintRequest {
    fn into_parts(self) -> Result<(MintTerms, String, String)> {
        let signature_requirement_type = match self.signature_requirement_type {
            Some(raw) => SignatureRequirementType::parse(&raw)?,
            None => SignatureRequirementType::default(),
        };
        let terms = MintTerms {
            title: required("title", self.title)?,
            description: self.description.unwrap_or_default(),
            fraction_count: required("fraction_count", self.fraction_count)?,
            tags: self.tags.unwrap_or_default(),
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
            feed_url: self.feed_url.unwrap_or_default(),
            public_key: required("public_key", self.public_key)?,
            signature_requirement_type,
            asset_managers: self.asset_managers.unwrap_or_default(),
            min_signatures: self.min_signatures.unwrap_or_default(),
        };
        Ok((
            terms,
            required("owner_address", self.owner_address)?,
            required("signature", self.signature)?,
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateInvoiceRequest {
    pub mint_hash: Option<String>,
    pub quantity: Option<i64>,
    pub price: Option<i64>,
    pub buyer_address: Option<String>,
    pub seller_address: Option<String>,
    pub payment_address: Option<String>,
    pub public_key: Option<String>,
    pub signature: Option<String>,
}

impl CreateInvoiceRequest {
    fn into_parts(self) -> Result<(InvoiceTerms, String)> {
        let terms = InvoiceTerms {
            mint_hash: required("mint_hash", self.mint_hash)?,
            quantity: required("quantity", self.quantity)?,
            price: self.price.unwrap_or_default(),
            buyer_address: required("buyer_address", self.buyer_address)?,
            seller_address: required("seller_address", self.seller_address)?,
            payment_address: required("payment_address", self.payment_address)?,
            public_key: required("public_key", self.public_key)?,
        };
        Ok((terms, required("signature", self.signature)?))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreatePaymentRequest {
    pub invoice_hash: Option<String>,
}

/// Query string for the list endpoints. Each endpoint reads the filters that
/// apply to it and ignores the rest.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub mint_hash: Option<String>,
    pub owner_address: Option<String>,
    /// Buyer or seller, for invoices.
    pub address: Option<String>,
    pub offerer_address: Option<String>,
    pub seller_address: Option<String>,
}

impl ListQuery {
    fn page(&self) -> Page {
        Page::new(self.page, self.limit)
    }
}

/// Body shared by asset-manager approvals and offer withdrawals.
#[derive(Debug, Default, Deserialize)]
pub struct SignedRequest {
    pub public_key: Option<String>,
    pub signature: Option<String>,
}

impl SignedRequest {
    fn into_parts(self) -> Result<(String, String)> {
        Ok((
            required("public_key", self.public_key)?,
            required("signature", self.signature)?,
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateOfferRequest {
    pub mint_hash: Option<String>,
    pub offerer_address: Option<String>,
    /// Buy offers only.
    pub seller_address: Option<String>,
    pub quantity: Option<i64>,
    pub price: Option<i64>,
    pub public_key: Option<String>,
    pub signature: Option<String>,
}

impl CreateOfferRequest {
    fn into_sell(self) -> Result<(SellOfferTerms, String)> {
        let terms = SellOfferTerms {
            mint_hash: required("mint_hash", self.mint_hash)?,
            offerer_address: required("offerer_address", self.offerer_address)?,
            quantity: required("quantity", self.quantity)?,
            price: self.price.unwrap_or_default(),
            public_key: required("public_key", self.public_key)?,
        };
        Ok((terms, required("signature", self.signature)?))
    }

    fn into_buy(self) -> Result<(BuyOfferTerms, String)> {
        let terms = BuyOfferTerms {
            mint_hash: required("mint_hash", self.mint_hash)?,
            offerer_address: required("offerer_address", self.offerer_address)?,
            seller_address: required("seller_address", self.seller_address)?,
            quantity: required("quantity", self.quantity)?,
            price: self.price.unwrap_or_default(),
            public_key: required("public_key", self.public_key)?,
        };
        Ok((terms, required("signature", self.signature)?))
    }
}

/// A scanned transaction. The action is given either as the raw hex envelope
/// or as explicit type, version and base64 payload.
#[derive(Debug, Default, Deserialize)]
pub struct IngestRequest {
    pub tx_hash: Option<String>,
    pub block_height: Option<i64>,
    pub block_hash: Option<String>,
    pub tx_index: Option<i64>,
    pub address: Option<String>,
    pub envelope_hex: Option<String>,
    pub action_type: Option<u8>,
    pub action_version: Option<u8>,
    pub payload_base64: Option<String>,
    pub values: Option<BTreeMap<String, serde_json::Value>>,
}

impl IngestRequest {
    fn into_transaction(self) -> Result<OnChainTransaction> {
        let envelope = match (self.envelope_hex, self.payload_base64) {
            (Some(raw), _) => {
                let bytes = hex::decode(raw.trim())
                    .map_err(|e| EngineError::Decode(format!("envelope is not hex: {e}")))?;
                Envelope::decode(&bytes)?
            }
            (None, Some(payload)) => Envelope {
                action_type: ActionType::from_code(required("action_type", self.action_type)?),
                version: required("action_version", self.action_version)?,
                payload: BASE64
                    .decode(payload.trim())
                    .map_err(|e| EngineError::Decode(format!("payload is not base64: {e}")))?,
            },
            (None, None) => {
                return Err(EngineError::Validation(
                    "either envelope_hex or payload_base64 is required".to_string(),
                ))
            }
        };

        let block_height = required("block_height", self.block_height)?;
        if block_height < 0 {
            return Err(EngineError::Validation("block_height must not be negative".to_string()));
        }
        Ok(OnChainTransaction {
            id: new_id(),
            tx_hash: required("tx_hash", self.tx_hash)?.to_lowercase(),
            block_height,
            block_hash: self.block_hash.unwrap_or_default(),
            tx_index: self.tx_index.unwrap_or_default(),
            action_type: envelope.action_type,
            action_version: envelope.version,
            action_payload: envelope.payload,
            address: required("address", self.address)?,
            values: self.values.unwrap_or_default(),
            created_at: now_unix(),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub version: &'static str,
    #[serde(flatten)]
    pub status: HealthStatus,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub address: String,
    pub mint_hash: String,
    pub settled: i64,
    pub pending: i64,
    pub offered: i64,
    pub available: i64,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub id: String,
    pub action_type: String,
}

#[derive(Debug, Serialize)]
pub struct GossipAck {
    pub kind: &'static str,
    pub accepted: bool,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
///
/// Serves the row last written by the health monitor; 404 until its first
/// successful check.
pub async fn get_health(State(state): State<Arc<ApiState>>) -> Result<Json<HealthResponse>> {
    let status = health::load(&state.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound("no health check recorded yet".to_string()))?;
    Ok(Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        status,
    }))
}

/// `GET /stats`
pub async fn stats(State(state): State<Arc<ApiState>>) -> Result<Json<TableCounts>> {
    Ok(Json(db::table_counts(&state.pool).await?))
}

/// `POST /mints`
pub async fn create_mint(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateMintRequest>,
) -> Result<(StatusCode, Json<ProposalReceipt>)> {
    let (terms, owner, signature) = req.into_parts()?;
    let receipt = mints::create_mint(&state.pool, &state.gossip, terms, owner, signature).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /mints`
pub async fn list_mints(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paged<Mint>>> {
    let page = mints::list_mints(&state.pool, query.owner_address.as_deref(), query.page()).await?;
    Ok(Json(page))
}

/// `GET /mints/:hash`
///
/// Returns the confirmed mint if there is one, else the pending proposal.
pub async fn get_mint(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
) -> Result<Json<MintRecord>> {
    Ok(Json(mints::find_mint(&state.pool, &hash).await?))
}

/// `POST /invoices`
pub async fn create_invoice(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<ProposalReceipt>)> {
    let (terms, signature) = req.into_parts()?;
    let receipt =
        invoices::create_invoice(&state.pool, &state.gossip, &state.limits, terms, signature)
            .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /invoices`
pub async fn list_invoices(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paged<Invoice>>> {
    let page = invoices::list_invoices(
        &state.pool,
        query.mint_hash.as_deref(),
        query.address.as_deref(),
        query.page(),
    )
    .await?;
    Ok(Json(page))
}

/// `POST /payments`
///
/// Builds the PAYMENT envelope for a confirmed invoice. Nothing is stored.
pub async fn create_payment(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<ProposalReceipt>)> {
    let invoice_hash = required("invoice_hash", req.invoice_hash)?;
    let receipt = invoices::create_payment(&state.pool, &invoice_hash).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `POST /invoices/:hash/signatures`
pub async fn submit_signature(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
    Json(req): Json<SignedRequest>,
) -> Result<(StatusCode, Json<SignatureOutcome>)> {
    let (public_key, signature) = req.into_parts()?;
    let outcome =
        invoices::submit_invoice_signature(&state.pool, &state.gossip, &hash, public_key, signature)
            .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `GET /balances/:address/:mint_hash`
pub async fn get_balance(
    State(state): State<Arc<ApiState>>,
    Path((address, mint_hash)): Path<(String, String)>,
) -> Result<Json<BalanceResponse>> {
    let snapshot = ledger::balance_snapshot(&state.pool, &address, &mint_hash).await?;
    Ok(Json(BalanceResponse {
        address,
        mint_hash,
        settled: snapshot.settled,
        pending: snapshot.pending,
        offered: snapshot.offered,
        available: snapshot.available(),
    }))
}

/// `GET /balances/:address`
pub async fn list_balances(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paged<TokenBalance>>> {
    let page =
        ledger::list_token_balances(&state.pool, &address, query.mint_hash.as_deref(), query.page())
            .await?;
    Ok(Json(page))
}

/// `GET /pending-balances/:address`
pub async fn list_pending_balances(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paged<PendingTokenBalance>>> {
    let page = ledger::list_pending_balances(
        &state.pool,
        &address,
        query.mint_hash.as_deref(),
        query.page(),
    )
    .await?;
    Ok(Json(page))
}

/// `GET /sell-offers`
pub async fn list_sell_offers(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paged<SellOffer>>> {
    let page = offers::page_sell_offers(
        &state.pool,
        query.mint_hash.as_deref(),
        query.offerer_address.as_deref(),
        query.page(),
    )
    .await?;
    Ok(Json(page))
}

/// `GET /buy-offers`
pub async fn list_buy_offers(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paged<BuyOffer>>> {
    let page = offers::page_buy_offers(
        &state.pool,
        query.mint_hash.as_deref(),
        query.offerer_address.as_deref(),
        query.seller_address.as_deref(),
        query.page(),
    )
    .await?;
    Ok(Json(page))
}

/// `POST /sell-offers`
pub async fn create_sell_offer(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateOfferRequest>,
) -> Result<(StatusCode, Json<SellOffer>)> {
    let (terms, signature) = req.into_sell()?;
    let offer =
        offers::create_sell_offer(&state.pool, &state.gossip, &state.limits, terms, signature)
            .await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

/// `POST /buy-offers`
pub async fn create_buy_offer(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateOfferRequest>,
) -> Result<(StatusCode, Json<BuyOffer>)> {
    let (terms, signature) = req.into_buy()?;
    let offer =
        offers::create_buy_offer(&state.pool, &state.gossip, &state.limits, terms, signature)
            .await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

/// `DELETE /sell-offers/:hash`
pub async fn delete_sell_offer(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
    Json(req): Json<SignedRequest>,
) -> Result<StatusCode> {
    withdraw(&state, OfferSide::Sell, hash, req).await
}

/// `DELETE /buy-offers/:hash`
pub async fn delete_buy_offer(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
    Json(req): Json<SignedRequest>,
) -> Result<StatusCode> {
    withdraw(&state, OfferSide::Buy, hash, req).await
}

async fn withdraw(
    state: &ApiState,
    side: OfferSide,
    hash: String,
    req: SignedRequest,
) -> Result<StatusCode> {
    let (public_key, signature) = req.into_parts()?;
    let deletion = OfferDeletion {
        hash,
        public_key,
        signature,
    };
    offers::delete_offer(&state.pool, &state.gossip, side, deletion).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /onchain-transactions`
///
/// Scanner ingest. Rows are stored as-is; the confirmation loops pick them up.
pub async fn ingest_onchain_transaction(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>)> {
    let tx = req.into_transaction()?;
    db::insert_onchain_transaction(&state.pool, &tx).await?;
    info!(
        id = %tx.id,
        tx_hash = %tx.tx_hash,
        block_height = tx.block_height,
        action = %tx.action_type,
        "Stored on-chain transaction"
    );
    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            id: tx.id,
            action_type: tx.action_type.to_string(),
        }),
    ))
}

/// `POST /gossip`
pub async fn receive_gossip(
    State(state): State<Arc<ApiState>>,
    Json(message): Json<GossipMessage>,
) -> Result<Json<GossipAck>> {
    let kind = message.kind();
    let accepted = gossip::accept_gossip(&state.pool, message).await?;
    Ok(Json(GossipAck { kind, accepted }))
}
