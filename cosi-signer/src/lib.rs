//! CoSi Signer Primitives
//!
//! Building blocks for BLS collective signatures:
//! - BLS12-381 suite (signing, verification, aggregation)
//! - Participation masks with cached aggregate public keys
//! - Acceptance policies (threshold, complete, custom)
//! - Verification of a final `signature || mask` blob

pub mod bls;
pub mod error;
pub mod mask;
pub mod policy;
pub mod verify;

pub use bls::*;
pub use error::*;
pub use mask::*;
pub use policy::*;
pub use verify::*;
