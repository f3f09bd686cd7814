//! # cosi-protocol
//!
//! Tree-structured, fault-tolerant BLS collective signing.
//!
//! The root of a roster-wide tree splits the other members into two-level
//! subtrees, runs one [`SubCosi`] per subtree in parallel and aggregates the
//! answers into a single `signature || mask` value that
//! [`cosi_signer::verify`] checks against a policy.
//!
//! ## Roles
//!
//! - **Root**: runs [`CosiProtocol`], verifies the proposal itself, fans
//!   out, recovers from unresponsive subleaders and aggregates.
//! - **Subleader**: forwards the announcement to its leaves and sends back
//!   a quick and a final aggregated answer.
//! - **Leaf**: verifies and signs, or signs a refusal.

pub mod config;
pub mod error;
pub mod key_distribution;
pub mod protocol;
pub mod sub_protocol;
pub mod subtree;

pub use config::*;
pub use error::*;
pub use key_distribution::*;
pub use protocol::*;
pub use sub_protocol::*;
pub use subtree::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Lock a mutex, recovering the data of a poisoned one
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve once the closing flag is raised or its sender is gone
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
