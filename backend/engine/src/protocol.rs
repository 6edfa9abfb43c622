//! On-chain action envelope and per-action payload codecs.
//!
//! A tokenisation transaction carries an envelope in its data output:
//!
//! | Offset | Size | Field                      |
//! |--------|------|----------------------------|
//! | 0      | 3    | magic `TKN`                |
//! | 3      | 1    | action type                |
//! | 4      | 1    | payload version            |
//! | 5      | ..   | action payload             |
//!
//! The chain scanner strips the envelope and stores action type, version and
//! payload on each `onchain_transactions` row. The payload layouts (v1):
//!
//! * `MINT`:    32-byte mint hash
//! * `INVOICE`: 32-byte invoice hash, 32-byte mint hash, u32 BE quantity
//! * `PAYMENT`: 32-byte invoice hash

use crate::errors::{EngineError, Result};

pub const ENVELOPE_MAGIC: [u8; 3] = *b"TKN";
pub const PAYLOAD_VERSION: u8 = 1;

const HASH_LEN: usize = 32;
const MINT_PAYLOAD_LEN: usize = HASH_LEN;
const INVOICE_PAYLOAD_LEN: usize = HASH_LEN * 2 + 4;
const PAYMENT_PAYLOAD_LEN: usize = HASH_LEN;

/// All action kinds the protocol defines. Codes outside the known set are
/// preserved as [`ActionType::Unknown`] so they can be skipped, not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Mint,
    Invoice,
    Payment,
    Unknown(u8),
}

impl ActionType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Mint,
            2 => Self::Invoice,
            3 => Self::Payment,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Mint => 1,
            Self::Invoice => 2,
            Self::Payment => 3,
            Self::Unknown(code) => code,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::Invoice => "invoice",
            Self::Payment => "payment",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl TryFrom<i64> for ActionType {
    type Error = EngineError;

    fn try_from(value: i64) -> Result<Self> {
        u8::try_from(value)
            .map(Self::from_code)
            .map_err(|_| EngineError::Decode(format!("action type {value} out of range")))
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintAction {
    pub hash: [u8; HASH_LEN],
}

impl MintAction {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.hash.to_vec()
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != MINT_PAYLOAD_LEN {
            return Err(EngineError::Decode(format!(
                "mint payload must be {MINT_PAYLOAD_LEN} bytes, got {}",
                payload.len()
            )));
        }
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(payload);
        Ok(Self { hash })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceAction {
    pub invoice_hash: [u8; HASH_LEN],
    pub mint_hash: [u8; HASH_LEN],
    pub quantity: u32,
}

impl InvoiceAction {
    pub fn invoice_hash_hex(&self) -> String {
        hex::encode(self.invoice_hash)
    }

    pub fn mint_hash_hex(&self) -> String {
        hex::encode(self.mint_hash)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INVOICE_PAYLOAD_LEN);
        out.extend_from_slice(&self.invoice_hash);
        out.extend_from_slice(&self.mint_hash);
        out.extend_from_slice(&self.quantity.to_be_bytes());
        out
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != INVOICE_PAYLOAD_LEN {
            return Err(EngineError::Decode(format!(
                "invoice payload must be {INVOICE_PAYLOAD_LEN} bytes, got {}",
                payload.len()
            )));
        }
        let mut invoice_hash = [0u8; HASH_LEN];
        let mut mint_hash = [0u8; HASH_LEN];
        let mut quantity = [0u8; 4];
        invoice_hash.copy_from_slice(&payload[..HASH_LEN]);
        mint_hash.copy_from_slice(&payload[HASH_LEN..HASH_LEN * 2]);
        quantity.copy_from_slice(&payload[HASH_LEN * 2..]);
        Ok(Self {
            invoice_hash,
            mint_hash,
            quantity: u32::from_be_bytes(quantity),
        })
    }
}

/// Settlement of a confirmed invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAction {
    pub invoice_hash: [u8; HASH_LEN],
}

impl PaymentAction {
    pub fn invoice_hash_hex(&self) -> String {
        hex::encode(self.invoice_hash)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.invoice_hash.to_vec()
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let invoice_hash = payload.try_into().map_err(|_| {
            EngineError::Decode(format!(
                "payment payload must be {PAYMENT_PAYLOAD_LEN} bytes, got {}",
                payload.len()
            ))
        })?;
        Ok(Self { invoice_hash })
    }
}

/// A decoded action payload, keyed by its action type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Mint(MintAction),
    Invoice(InvoiceAction),
    Payment(PaymentAction),
    /// Recognised or unrecognised types this engine does not act on.
    Other(ActionType),
}

/// Decode a stored payload according to its action type and version.
pub fn decode_action(action_type: ActionType, version: u8, payload: &[u8]) -> Result<Action> {
    match action_type {
        ActionType::Mint | ActionType::Invoice | ActionType::Payment
            if version != PAYLOAD_VERSION =>
        {
            Err(EngineError::Decode(format!(
                "unsupported {action_type} payload version {version}"
            )))
        }
        ActionType::Mint => MintAction::decode(payload).map(Action::Mint),
        ActionType::Invoice => InvoiceAction::decode(payload).map(Action::Invoice),
        ActionType::Payment => PaymentAction::decode(payload).map(Action::Payment),
        other => Ok(Action::Other(other)),
    }
}

/// Parse a 64-char hex hash into raw bytes.
pub fn hash_bytes(hash_hex: &str) -> Result<[u8; HASH_LEN]> {
    let raw = hex::decode(hash_hex)
        .map_err(|e| EngineError::Validation(format!("hash is not hex: {e}")))?;
    raw.try_into()
        .map_err(|_| EngineError::Validation(format!("hash must be {HASH_LEN} bytes")))
}

/// The full data-output body a proposer broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub action_type: ActionType,
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn mint(action: &MintAction) -> Self {
        Self {
            action_type: ActionType::Mint,
            version: PAYLOAD_VERSION,
            payload: action.encode(),
        }
    }

    pub fn invoice(action: &InvoiceAction) -> Self {
        Self {
            action_type: ActionType::Invoice,
            version: PAYLOAD_VERSION,
            payload: action.encode(),
        }
    }

    pub fn payment(action: &PaymentAction) -> Self {
        Self {
            action_type: ActionType::Payment,
            version: PAYLOAD_VERSION,
            payload: action.encode(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_MAGIC.len() + 2 + self.payload.len());
        out.extend_from_slice(&ENVELOPE_MAGIC);
        out.push(self.action_type.code());
        out.push(self.version);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = ENVELOPE_MAGIC.len() + 2;
        if bytes.len() < header || bytes[..ENVELOPE_MAGIC.len()] != ENVELOPE_MAGIC {
            return Err(EngineError::Decode("missing envelope magic".to_string()));
        }
        Ok(Self {
            action_type: ActionType::from_code(bytes[3]),
            version: bytes[4],
            payload: bytes[header..].to_vec(),
        })
    }
}
