//! Collective signing wire messages
//!
//! Every message travels inside an [`Envelope`] addressed by roster index and
//! tagged with the protocol instance it belongs to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkResult;
use crate::tree::Tree;

/// Message ID type
pub type MessageId = String;

/// Protocol instance ID type
pub type InstanceId = String;

/// Message envelope delivered by the overlay
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Unique message ID
    pub message_id: MessageId,
    /// Protocol instance the message belongs to
    pub instance_id: InstanceId,
    /// Registered protocol name, used to instantiate the receiver
    pub protocol: String,
    /// Tree the instance runs on
    pub tree: Arc<Tree>,
    /// Sender roster index
    pub from: usize,
    /// Recipient roster index
    pub to: usize,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Message payload
    pub payload: MessagePayload,
}

impl Envelope {
    pub fn new(
        instance_id: InstanceId,
        protocol: String,
        tree: Arc<Tree>,
        from: usize,
        to: usize,
        payload: MessagePayload,
    ) -> Self {
        Self {
            message_id: generate_message_id(),
            instance_id,
            protocol,
            tree,
            from,
            to,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Message payload types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MessagePayload {
    /// Top-down request to sign
    Announcement(Announcement),
    /// Bottom-up (aggregated) answer
    Response(Response),
    /// Tear down a sub-protocol instance
    Stop,
    /// Ask every node for its public key
    KeyRequest,
    /// Public key of the replying node
    KeyReply(KeyReply),
    /// Full list of public keys in roster order
    KeyDistribute(KeyDistribute),
}

impl MessagePayload {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Announcement(_) => "Announcement",
            Self::Response(_) => "Response",
            Self::Stop => "Stop",
            Self::KeyRequest => "KeyRequest",
            Self::KeyReply(_) => "KeyReply",
            Self::KeyDistribute(_) => "KeyDistribute",
        }
    }

    /// Encode for the wire
    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> NetworkResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Announcement payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Message to sign
    pub msg: Vec<u8>,
    /// Additional data handed to the verification predicate
    pub data: Vec<u8>,
    /// Time the receiver has to answer
    pub timeout: Duration,
    /// Number of signatures the receiving subtree aims for
    pub threshold: usize,
}

/// Response payload
///
/// `signature` is `None` when no participant below the sender accepted.
/// `refusals` maps a refusing roster index to its signature over the
/// refusal message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub signature: Option<Vec<u8>>,
    pub mask: Vec<u8>,
    #[serde(default)]
    pub refusals: BTreeMap<usize, Vec<u8>>,
}

impl Response {
    /// Response carrying an accepted signature
    pub fn accepted(signature: Vec<u8>, mask: Vec<u8>) -> Self {
        Self {
            signature: Some(signature),
            mask,
            refusals: BTreeMap::new(),
        }
    }

    /// Response of a single node that refused
    pub fn refused(mask: Vec<u8>, index: usize, proof: Vec<u8>) -> Self {
        Self {
            signature: None,
            mask,
            refusals: BTreeMap::from([(index, proof)]),
        }
    }

    pub fn is_refusal(&self) -> bool {
        self.signature.is_none()
    }
}

/// Key distribution reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReply {
    pub public: Vec<u8>,
}

/// Key distribution result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDistribute {
    pub publics: Vec<Vec<u8>>,
}

/// Generate a unique message ID
fn generate_message_id() -> MessageId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    let timestamp = Utc::now().timestamp_micros();
    format!("msg_{:016x}_{:08x}", timestamp, seq)
}

/// Generate a unique protocol instance ID
pub fn generate_instance_id() -> InstanceId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    let timestamp = Utc::now().timestamp_micros();
    format!("pi_{:016x}_{:08x}", timestamp, seq)
}
