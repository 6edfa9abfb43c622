//! Ed25519 signatures over canonical payloads.
//!
//! Public keys and signatures travel as lowercase hex (32 and 64 bytes).

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, Result};

/// SHA-256 of `tag || body`, hex-encoded. Used for every content hash.
pub fn content_hash(tag: &[u8], body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let raw = hex::decode(public_key_hex)
        .map_err(|e| EngineError::Validation(format!("public key is not hex: {e}")))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| EngineError::Validation("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| EngineError::Validation(format!("invalid public key: {e}")))
}

fn parse_signature(signature_hex: &str) -> Result<Signature> {
    let raw = hex::decode(signature_hex)
        .map_err(|e| EngineError::Validation(format!("signature is not hex: {e}")))?;
    let bytes: [u8; 64] = raw
        .try_into()
        .map_err(|_| EngineError::Validation("signature must be 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

/// Verify `signature_hex` over `message` with `public_key_hex`.
pub fn verify(public_key_hex: &str, signature_hex: &str, message: &[u8]) -> Result<()> {
    let key = parse_public_key(public_key_hex)?;
    let signature = parse_signature(signature_hex)?;
    key.verify(message, &signature)
        .map_err(|_| EngineError::Validation("signature verification failed".to_string()))
}

pub fn is_valid(public_key_hex: &str, signature_hex: &str, message: &[u8]) -> bool {
    verify(public_key_hex, signature_hex, message).is_ok()
}
