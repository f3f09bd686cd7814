//! BLS12-381 signing suite
//!
//! Wraps the blst `min_pk` variant: public keys are compressed G1 points
//! (48 bytes), signatures are compressed G2 points (96 bytes). All signing
//! and verification goes through a [`BlsSuite`] value so that the domain
//! separation tag is chosen by whoever builds the protocol stack.

use std::fmt;

use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroize;

use crate::error::{SignerError, SignerResult};

/// Default domain separation tag for collective signatures
pub const DEFAULT_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_COSI:v1";

/// Length of a compressed public key
pub const PUBLIC_KEY_LEN: usize = 48;

/// Length of a compressed signature, also the offset of the mask in a final signature
pub const SIGNATURE_LEN: usize = 96;

/// Cryptographic suite shared by every participant of a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlsSuite {
    dst: Vec<u8>,
}

impl Default for BlsSuite {
    fn default() -> Self {
        Self::new(DEFAULT_DST)
    }
}

impl BlsSuite {
    /// Create a suite with a custom domain separation tag
    pub fn new(dst: &[u8]) -> Self {
        Self { dst: dst.to_vec() }
    }

    /// Domain separation tag
    pub fn dst(&self) -> &[u8] {
        &self.dst
    }

    /// Sign a message
    pub fn sign(&self, secret: &BlsSecretKey, message: &[u8]) -> BlsSignature {
        BlsSignature {
            inner: secret.inner.sign(message, &self.dst, &[]),
        }
    }

    /// Verify a signature against a single (possibly aggregated) public key
    pub fn verify(
        &self,
        public: &BlsPublicKey,
        message: &[u8],
        signature: &BlsSignature,
    ) -> SignerResult<()> {
        let result = signature
            .inner
            .verify(true, message, &self.dst, &[], &public.inner, true);
        if result == BLST_ERROR::BLST_SUCCESS {
            Ok(())
        } else {
            Err(SignerError::InvalidSignature(format!(
                "BLS verification failed: {:?}",
                result
            )))
        }
    }
}

/// BLS secret key wrapper
#[derive(Clone)]
pub struct BlsSecretKey {
    inner: SecretKey,
    /// Key identifier (first 8 bytes of public key hex)
    pub kid: String,
}

impl BlsSecretKey {
    /// Generate a new random BLS secret key
    pub fn generate() -> SignerResult<Self> {
        let mut ikm = [0u8; 32];
        OsRng.fill_bytes(&mut ikm);
        let key = Self::from_seed(&ikm);
        ikm.zeroize();
        key
    }

    /// Derive a key from input key material (at least 32 bytes)
    pub fn from_seed(ikm: &[u8]) -> SignerResult<Self> {
        let sk = SecretKey::key_gen(ikm, &[])
            .map_err(|e| SignerError::Crypto(format!("Key generation failed: {:?}", e)))?;
        Ok(Self::wrap(sk))
    }

    /// Create from raw bytes (32 bytes)
    pub fn from_bytes(bytes: &[u8; 32]) -> SignerResult<Self> {
        let sk = SecretKey::from_bytes(bytes)
            .map_err(|e| SignerError::Crypto(format!("Invalid BLS secret key: {:?}", e)))?;
        Ok(Self::wrap(sk))
    }

    fn wrap(sk: SecretKey) -> Self {
        let kid = hex::encode(&sk.sk_to_pk().compress()[..8]);
        Self { inner: sk, kid }
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    /// Export to bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

impl fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlsSecretKey").field("kid", &self.kid).finish()
    }
}

/// Secret key together with its public key
#[derive(Clone, Debug)]
pub struct BlsKeyPair {
    pub secret: BlsSecretKey,
    pub public: BlsPublicKey,
}

impl BlsKeyPair {
    /// Generate a random key pair
    pub fn generate() -> SignerResult<Self> {
        BlsSecretKey::generate().map(Self::from_secret)
    }

    /// Deterministic key pair, used by local test networks
    pub fn from_seed(ikm: &[u8]) -> SignerResult<Self> {
        BlsSecretKey::from_seed(ikm).map(Self::from_secret)
    }

    fn from_secret(secret: BlsSecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

/// BLS public key wrapper
#[derive(Clone, Debug)]
pub struct BlsPublicKey {
    inner: PublicKey,
}

impl BlsPublicKey {
    /// Create from compressed bytes (48 bytes)
    pub fn from_bytes(bytes: &[u8]) -> SignerResult<Self> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(SignerError::Crypto(format!(
                "Invalid BLS public key length: expected {}, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }
        let pk = PublicKey::from_bytes(bytes)
            .map_err(|e| SignerError::Crypto(format!("Invalid BLS public key: {:?}", e)))?;
        Ok(Self { inner: pk })
    }

    /// Create from hex string
    pub fn from_hex(hex_str: &str) -> SignerResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| SignerError::Crypto(format!("Invalid hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Export to compressed bytes (48 bytes)
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.compress()
    }

    /// Export to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

/// BLS signature wrapper
#[derive(Clone, Debug)]
pub struct BlsSignature {
    inner: Signature,
}

impl BlsSignature {
    /// Create from compressed bytes (96 bytes)
    pub fn from_bytes(bytes: &[u8]) -> SignerResult<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(SignerError::Crypto(format!(
                "Invalid BLS signature length: expected {}, got {}",
                SIGNATURE_LEN,
                bytes.len()
            )));
        }
        let sig = Signature::from_bytes(bytes)
            .map_err(|e| SignerError::Crypto(format!("Invalid BLS signature: {:?}", e)))?;
        Ok(Self { inner: sig })
    }

    /// Create from hex string
    pub fn from_hex(hex_str: &str) -> SignerResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| SignerError::Crypto(format!("Invalid hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Export to compressed bytes (96 bytes)
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.inner.compress()
    }

    /// Export to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsSignature {}

/// Point-sum of signatures
pub fn aggregate_signatures(signatures: &[BlsSignature]) -> SignerResult<BlsSignature> {
    let (first, rest) = signatures
        .split_first()
        .ok_or_else(|| SignerError::Crypto("No signatures to aggregate".to_string()))?;

    let mut agg_sig = AggregateSignature::from_signature(&first.inner);
    for sig in rest {
        agg_sig
            .add_signature(&sig.inner, true)
            .map_err(|e| SignerError::Crypto(format!("Failed to aggregate signature: {:?}", e)))?;
    }

    Ok(BlsSignature {
        inner: agg_sig.to_signature(),
    })
}

/// Point-sum of public keys
pub fn aggregate_public_keys(pubkeys: &[&BlsPublicKey]) -> SignerResult<BlsPublicKey> {
    if pubkeys.is_empty() {
        return Err(SignerError::Crypto("No public keys to aggregate".to_string()));
    }

    let pk_refs: Vec<&PublicKey> = pubkeys.iter().map(|pk| &pk.inner).collect();

    let agg_pk = AggregatePublicKey::aggregate(&pk_refs, true)
        .map_err(|e| SignerError::Crypto(format!("Failed to aggregate public keys: {:?}", e)))?;

    Ok(BlsPublicKey {
        inner: agg_pk.to_public_key(),
    })
}

/// Message a participant signs to prove it refused: `msg || ":" || index`
pub fn refusal_message(message: &[u8], index: usize) -> Vec<u8> {
    let suffix = format!(":{}", index);
    let mut out = Vec::with_capacity(message.len() + suffix.len());
    out.extend_from_slice(message);
    out.extend_from_slice(suffix.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> BlsKeyPair {
        BlsKeyPair::from_seed(&[seed; 32]).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let suite = BlsSuite::default();
        let kp = keypair(1);
        let sig = suite.sign(&kp.secret, b"collective message");

        assert!(suite.verify(&kp.public, b"collective message", &sig).is_ok());
        assert!(suite.verify(&kp.public, b"another message", &sig).is_err());
    }

    #[test]
    fn test_suite_dst_separates_domains() {
        let kp = keypair(2);
        let sig = BlsSuite::default().sign(&kp.secret, b"msg");
        let other = BlsSuite::new(b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_OTHER:v1");

        assert!(other.verify(&kp.public, b"msg", &sig).is_err());
    }

    #[test]
    fn test_deterministic_seed() {
        assert_eq!(keypair(7).public, keypair(7).public);
        assert_ne!(keypair(7).public, keypair(8).public);
    }

    #[test]
    fn test_short_seed_rejected() {
        assert!(BlsKeyPair::from_seed(&[1u8; 16]).is_err());
    }

    #[test]
    fn test_key_encoding() {
        let kp = keypair(3);
        let restored = BlsPublicKey::from_hex(&kp.public.to_hex()).unwrap();
        assert_eq!(restored, kp.public);
        assert!(BlsPublicKey::from_bytes(&[0u8; 47]).is_err());

        let secret = BlsSecretKey::from_bytes(&kp.secret.to_bytes()).unwrap();
        assert_eq!(secret.public_key(), kp.public);
        assert_eq!(secret.kid, kp.secret.kid);
    }

    #[test]
    fn test_signature_encoding() {
        let suite = BlsSuite::default();
        let sig = suite.sign(&keypair(4).secret, b"msg");
        let restored = BlsSignature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(restored, sig);
        assert!(BlsSignature::from_bytes(&[0u8; 95]).is_err());
    }

    #[test]
    fn test_aggregate_verification() {
        let suite = BlsSuite::default();
        let message = b"aggregate me";
        let pairs: Vec<BlsKeyPair> = (10..15).map(keypair).collect();

        let sigs: Vec<BlsSignature> = pairs.iter().map(|kp| suite.sign(&kp.secret, message)).collect();
        let agg_sig = aggregate_signatures(&sigs).unwrap();

        let pubs: Vec<&BlsPublicKey> = pairs.iter().map(|kp| &kp.public).collect();
        let agg_pk = aggregate_public_keys(&pubs).unwrap();

        assert!(suite.verify(&agg_pk, message, &agg_sig).is_ok());

        // Missing one signer
        let partial = aggregate_public_keys(&pubs[1..]).unwrap();
        assert!(suite.verify(&partial, message, &agg_sig).is_err());
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(aggregate_signatures(&[]).is_err());
        assert!(aggregate_public_keys(&[]).is_err());
    }

    #[test]
    fn test_refusal_message() {
        assert_eq!(refusal_message(b"abc", 12), b"abc:12".to_vec());
        assert_eq!(refusal_message(b"", 0), b":0".to_vec());
    }
}
