//! CoSi Network Layer
//!
//! Message-passing substrate for collective signing:
//! - Roster of participants and trees over roster indices
//! - Wire messages (announcement, response, stop, key distribution)
//! - Conodes with a protocol registry and lazy instantiation
//! - In-memory overlay with pause/resume for unresponsive-node tests

pub mod error;
pub mod message;
pub mod node;
pub mod roster;
pub mod router;
pub mod tree;

pub use error::*;
pub use message::*;
pub use node::*;
pub use roster::*;
pub use router::*;
pub use tree::*;
