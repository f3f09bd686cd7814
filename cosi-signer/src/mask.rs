//! Participation mask
//!
//! A bit-vector over the roster recording which participants contributed to
//! an aggregate, together with the aggregate public key of the enabled
//! participants. Bit `i` lives in byte `i / 8` at position `i % 8`.
//!
//! The bit-vector is only ever replaced wholesale through [`Mask::set_mask`],
//! which also recomputes the cached aggregate key.

use crate::bls::{aggregate_public_keys, BlsPublicKey};
use crate::error::{SignerError, SignerResult};

/// Number of bytes needed to hold `n` bits
pub fn mask_len(n: usize) -> usize {
    n.div_ceil(8)
}

/// Participation bitmap with cached aggregate public key
#[derive(Clone, Debug)]
pub struct Mask {
    publics: Vec<BlsPublicKey>,
    mask: Vec<u8>,
    aggregate: Option<BlsPublicKey>,
}

impl Mask {
    /// Create a mask over `publics`. `my_index`, when given, starts enabled.
    pub fn new(publics: &[BlsPublicKey], my_index: Option<usize>) -> SignerResult<Self> {
        let mut mask = Self {
            publics: publics.to_vec(),
            mask: vec![0u8; mask_len(publics.len())],
            aggregate: None,
        };

        if let Some(index) = my_index {
            mask.set_index(index, true)?;
        }

        Ok(mask)
    }

    /// Replace the bit-vector and recompute the aggregate public key
    pub fn set_mask(&mut self, bits: &[u8]) -> SignerResult<()> {
        if bits.len() != self.mask.len() {
            return Err(SignerError::InvalidMask(format!(
                "mismatching mask lengths: expected {}, got {}",
                self.mask.len(),
                bits.len()
            )));
        }

        let enabled: Vec<&BlsPublicKey> = self
            .publics
            .iter()
            .enumerate()
            .filter(|(i, _)| bit_is_set(bits, *i))
            .map(|(_, pk)| pk)
            .collect();

        let total_set: usize = bits.iter().map(|b| b.count_ones() as usize).sum();
        if total_set != enabled.len() {
            return Err(SignerError::InvalidMask(
                "bits set beyond the number of participants".to_string(),
            ));
        }

        let aggregate = if enabled.is_empty() {
            None
        } else {
            Some(aggregate_public_keys(&enabled)?)
        };

        self.mask = bits.to_vec();
        self.aggregate = aggregate;
        Ok(())
    }

    /// Enable or disable a single participant
    pub fn set_index(&mut self, index: usize, enabled: bool) -> SignerResult<()> {
        if index >= self.publics.len() {
            return Err(SignerError::IndexOutOfRange {
                index,
                len: self.publics.len(),
            });
        }

        let mut bits = self.mask.clone();
        let (byte, bit) = (index >> 3, 1u8 << (index & 7));
        if enabled {
            bits[byte] |= bit;
        } else {
            bits[byte] &= !bit;
        }
        self.set_mask(&bits)
    }

    /// OR another bit-vector into this mask
    pub fn merge(&mut self, bits: &[u8]) -> SignerResult<()> {
        let merged = aggregate_masks(&self.mask, bits)?;
        self.set_mask(&merged)
    }

    /// Raw bit-vector
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Whether participant `index` is enabled
    pub fn is_index_enabled(&self, index: usize) -> bool {
        index < self.publics.len() && bit_is_set(&self.mask, index)
    }

    /// Indices of the enabled participants, in roster order
    pub fn enabled_indices(&self) -> Vec<usize> {
        (0..self.publics.len())
            .filter(|&i| bit_is_set(&self.mask, i))
            .collect()
    }

    /// Number of enabled participants
    pub fn count_enabled(&self) -> usize {
        self.mask.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Number of participants
    pub fn count_total(&self) -> usize {
        self.publics.len()
    }

    /// Length of the bit-vector in bytes
    pub fn mask_len(&self) -> usize {
        self.mask.len()
    }

    /// Public keys the mask is defined over
    pub fn publics(&self) -> &[BlsPublicKey] {
        &self.publics
    }

    /// Sum of the enabled public keys, `None` when nobody is enabled
    pub fn aggregate_public(&self) -> Option<&BlsPublicKey> {
        self.aggregate.as_ref()
    }
}

fn bit_is_set(bits: &[u8], index: usize) -> bool {
    bits.get(index >> 3)
        .map(|byte| byte & (1u8 << (index & 7)) != 0)
        .unwrap_or(false)
}

/// Bitwise OR of two bit-vectors of the same length
pub fn aggregate_masks(a: &[u8], b: &[u8]) -> SignerResult<Vec<u8>> {
    if a.len() != b.len() {
        return Err(SignerError::InvalidMask(format!(
            "cannot aggregate masks of lengths {} and {}",
            a.len(),
            b.len()
        )));
    }

    Ok(a.iter().zip(b).map(|(x, y)| x | y).collect())
}
