//! # cosi-service
//!
//! Signature requests on top of the collective signing protocol. A conode
//! running [`CosiService`] roots a tree over the requested roster, runs one
//! signing round and returns the message hash with the final
//! `signature || mask`.

pub mod config;
pub mod error;
pub mod service;

pub use config::ServiceConfig;
pub use error::{ServiceError, ServiceResult};
pub use service::{CosiService, SignatureRequest, SignatureResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber
///
/// Filters come from `RUST_LOG`, falling back to `info`. Calling it again
/// once a subscriber is installed does nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
