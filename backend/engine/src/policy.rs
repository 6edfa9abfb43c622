//! Asset-manager signature policy for invoices.

use std::collections::HashSet;

use serde::Serialize;

use crate::crypto;
use crate::errors::{EngineError, Result};
use crate::models::{InvoiceSignature, MintTerms, SignatureRequirementType, UnconfirmedInvoice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyVerdict {
    pub satisfied: bool,
    /// Distinct registered managers with a verifying signature.
    pub valid_signers: usize,
    pub required: usize,
}

/// Number of distinct manager approvals `terms` demands. Rejects policies
/// that can never be met or that name no managers.
pub fn required_signatures(terms: &MintTerms) -> Result<usize> {
    let managers = manager_keys(terms).len();
    match terms.signature_requirement_type {
        SignatureRequirementType::None => Ok(0),
        SignatureRequirementType::OneSignature | SignatureRequirementType::AllSignatures
            if managers == 0 =>
        {
            Err(EngineError::Validation(format!(
                "{} policy requires at least one asset manager",
                terms.signature_requirement_type.as_str()
            )))
        }
        SignatureRequirementType::OneSignature => Ok(1),
        SignatureRequirementType::AllSignatures => Ok(managers),
        SignatureRequirementType::MinSignatures => {
            let min = terms.min_signatures;
            if min < 1 || min as usize > managers {
                return Err(EngineError::Validation(format!(
                    "MIN_SIGNATURES threshold {min} must be between 1 and {managers}"
                )));
            }
            Ok(min as usize)
        }
    }
}

pub fn evaluate(
    terms: &MintTerms,
    invoice: &UnconfirmedInvoice,
    signatures: &[InvoiceSignature],
) -> Result<PolicyVerdict> {
    let required = required_signatures(terms)?;
    if required == 0 {
        return Ok(PolicyVerdict {
            satisfied: true,
            valid_signers: 0,
            required,
        });
    }

    let managers = manager_keys(terms);
    let payload = invoice.approval_payload();
    let signers: HashSet<String> = signatures
        .iter()
        .filter(|s| s.invoice_hash == invoice.hash)
        .map(|s| (s.public_key.to_ascii_lowercase(), s))
        .filter(|(key, _)| managers.contains(key))
        .filter(|(_, s)| crypto::is_valid(&s.public_key, &s.signature, &payload))
        .map(|(key, _)| key)
        .collect();

    Ok(PolicyVerdict {
        satisfied: signers.len() >= required,
        valid_signers: signers.len(),
        required,
    })
}

/// Like [`evaluate`], but an unmet policy is an error.
pub fn require_satisfied(
    terms: &MintTerms,
    invoice: &UnconfirmedInvoice,
    signatures: &[InvoiceSignature],
) -> Result<PolicyVerdict> {
    let verdict = evaluate(terms, invoice, signatures)?;
    if !verdict.satisfied {
        return Err(EngineError::SignaturePolicyUnsatisfied {
            invoice_hash: invoice.hash.clone(),
            reason: format!(
                "{} requires {} asset manager signatures, have {}",
                terms.signature_requirement_type.as_str(),
                verdict.required,
                verdict.valid_signers
            ),
        });
    }
    Ok(verdict)
}

fn manager_keys(terms: &MintTerms) -> HashSet<String> {
    terms
        .asset_managers
        .iter()
        .map(|m| m.public_key.to_ascii_lowercase())
        .collect()
}
