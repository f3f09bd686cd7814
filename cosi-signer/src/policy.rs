//! Acceptance policies over a participation mask

use crate::mask::Mask;

/// Predicate deciding whether a mask carries enough participation
pub trait Policy: Send + Sync {
    fn check(&self, mask: &Mask) -> bool;
}

/// At least `threshold` participants enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    threshold: usize,
}

impl ThresholdPolicy {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Policy for ThresholdPolicy {
    fn check(&self, mask: &Mask) -> bool {
        mask.count_enabled() >= self.threshold
    }
}

/// Every participant enabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletePolicy;

impl Policy for CompletePolicy {
    fn check(&self, mask: &Mask) -> bool {
        mask.count_enabled() == mask.count_total()
    }
}

impl<F> Policy for F
where
    F: Fn(&Mask) -> bool + Send + Sync,
{
    fn check(&self, mask: &Mask) -> bool {
        self(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::{BlsKeyPair, BlsPublicKey};

    fn mask_with(n: usize, enabled: &[usize]) -> Mask {
        let pubs: Vec<BlsPublicKey> = (0..n)
            .map(|i| BlsKeyPair::from_seed(&[i as u8 + 60; 32]).unwrap().public)
            .collect();
        let mut mask = Mask::new(&pubs, None).unwrap();
        for &i in enabled {
            mask.set_index(i, true).unwrap();
        }
        mask
    }

    #[test]
    fn test_threshold_policy() {
        let mask = mask_with(5, &[0, 2, 4]);
        assert!(ThresholdPolicy::new(3).check(&mask));
        assert!(ThresholdPolicy::new(0).check(&mask));
        assert!(!ThresholdPolicy::new(4).check(&mask));
    }

    #[test]
    fn test_complete_policy() {
        assert!(!CompletePolicy.check(&mask_with(3, &[0, 1])));
        assert!(CompletePolicy.check(&mask_with(3, &[0, 1, 2])));
    }

    #[test]
    fn test_custom_policy() {
        let first_signed = |mask: &Mask| mask.is_index_enabled(0);
        assert!(first_signed.check(&mask_with(3, &[0])));
        assert!(!first_signed.check(&mask_with(3, &[1, 2])));
    }
}
