//! Verification of a final collective signature
//!
//! A final signature is `signature || mask`: the 96-byte aggregate followed
//! by the participation bit-vector over the roster.

use tracing::debug;

use crate::bls::{BlsPublicKey, BlsSignature, BlsSuite, SIGNATURE_LEN};
use crate::error::{SignerError, SignerResult};
use crate::mask::Mask;
use crate::policy::Policy;

/// Split a final signature into its aggregate signature and mask bytes
pub fn split_signature(sig: &[u8]) -> SignerResult<(BlsSignature, &[u8])> {
    if sig.len() < SIGNATURE_LEN {
        return Err(SignerError::InvalidSignature(format!(
            "signature too short: {} bytes",
            sig.len()
        )));
    }
    let (point, mask) = sig.split_at(SIGNATURE_LEN);
    Ok((BlsSignature::from_bytes(point)?, mask))
}

/// Concatenate an aggregate signature and its mask
pub fn append_signature_and_mask(signature: &BlsSignature, mask: &Mask) -> Vec<u8> {
    let mut out = signature.to_bytes().to_vec();
    out.extend_from_slice(mask.mask());
    out
}

/// Check a final signature over `message` against `publics` and `policy`
pub fn verify(
    suite: &BlsSuite,
    publics: &[BlsPublicKey],
    message: &[u8],
    sig: &[u8],
    policy: &dyn Policy,
) -> SignerResult<()> {
    if publics.is_empty() {
        return Err(SignerError::EmptyInput("no public keys".to_string()));
    }
    if message.is_empty() {
        return Err(SignerError::EmptyInput("no message".to_string()));
    }
    if sig.is_empty() {
        return Err(SignerError::EmptyInput("no signature".to_string()));
    }

    let (signature, bits) = split_signature(sig)?;

    let mut mask = Mask::new(publics, None)?;
    mask.set_mask(bits)?;

    let aggregate = mask
        .aggregate_public()
        .ok_or_else(|| SignerError::VerificationFailed("no participant in mask".to_string()))?;

    suite
        .verify(aggregate, message, &signature)
        .map_err(|e| SignerError::VerificationFailed(e.to_string()))?;

    if !policy.check(&mask) {
        debug!(
            enabled = mask.count_enabled(),
            total = mask.count_total(),
            "policy rejected collective signature"
        );
        return Err(SignerError::PolicyNotFulfilled);
    }

    Ok(())
}
