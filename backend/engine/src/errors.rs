//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("insufficient token balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Signature policy unsatisfied for invoice {invoice_hash}: {reason}")]
    SignaturePolicyUnsatisfied { invoice_hash: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Chain RPC error: {0}")]
    Chain(String),
}

impl EngineError {
    /// Errors that leave the on-chain row in place for a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::SignaturePolicyUnsatisfied { .. }
                | Self::InsufficientBalance { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
