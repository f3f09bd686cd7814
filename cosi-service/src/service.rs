//! Collective signing service

use std::sync::Arc;
use std::time::Duration;

use cosi_network::{Conode, ProtocolInstance, Roster, Tree};
use cosi_protocol::{
    create_on_conode, default_subtrees, register_key_distribution, register_protocols,
    CosiProtocol, KeyDistribution, ProtocolError, VerificationFn,
};
use cosi_signer::{verify, BlsPublicKey, Policy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};

/// Extra time granted on top of the protocol timeout
const FINAL_SIGNATURE_GRACE: Duration = Duration::from_secs(1);

/// Ask the roster to collectively sign `message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    #[serde(with = "hex_bytes")]
    pub message: Vec<u8>,
    pub roster: Roster,
}

/// SHA-256 of the message and the final `signature || mask`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResponse {
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

pub struct CosiService {
    conode: Arc<Conode>,
    config: ServiceConfig,
}

impl CosiService {
    /// Register the signing and key distribution protocols on `conode`
    pub async fn new(
        conode: Arc<Conode>,
        config: ServiceConfig,
        verification: VerificationFn,
    ) -> ServiceResult<Self> {
        config.validate()?;

        register_protocols(
            &conode,
            &config.protocol_name,
            &config.subprotocol_name,
            verification.clone(),
            verification,
        )
        .await;
        register_key_distribution(&conode).await;

        Ok(Self { conode, config })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn conode(&self) -> &Arc<Conode> {
        &self.conode
    }

    /// Run one signing round rooted at this conode
    pub async fn sign(&self, request: SignatureRequest) -> ServiceResult<SignatureResponse> {
        let roster = Arc::new(request.roster);
        if roster.is_empty() {
            return Err(ServiceError::EmptyRoster);
        }
        let root = self
            .conode
            .index_in(&roster)
            .ok_or(ServiceError::NotInRoster)?;

        let n = roster.len();
        let tree = Arc::new(Tree::star(roster, root)?);
        let protocol =
            CosiProtocol::create(&self.conode, &self.config.protocol_name, tree).await?;

        protocol.set_message(request.message.clone());
        protocol.set_create_protocol(create_on_conode(&self.conode));
        protocol.set_subprotocol_name(self.config.subprotocol_name.clone());
        protocol.set_timeout(self.config.timeout());
        if let Some(threshold) = self.config.threshold {
            protocol.set_threshold(threshold);
        }
        if n > 1 {
            let k = self.config.nsubtrees.unwrap_or_else(|| default_subtrees(n));
            protocol.set_nbr_subtree(k.min(n - 1))?;
        }

        let final_signature = protocol
            .final_signature()
            .ok_or_else(|| ServiceError::Config("final signature already taken".to_string()))?;
        protocol.start().await?;
        debug!(nodes = n, threshold = protocol.threshold(), "signature request started");

        let wait = self.config.timeout() + FINAL_SIGNATURE_GRACE;
        let signature = match tokio::time::timeout(wait, final_signature).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ProtocolError::Finished.into()),
            Err(_) => {
                warn!(nodes = n, "no final signature in time");
                protocol.shutdown().await;
                return Err(ServiceError::Timeout);
            }
        };

        info!(nodes = n, bytes = signature.len(), "message collectively signed");
        Ok(SignatureResponse {
            hash: Sha256::digest(&request.message).to_vec(),
            signature,
        })
    }

    /// Check a response against the roster that signed it
    pub fn verify(
        &self,
        message: &[u8],
        roster: &Roster,
        response: &SignatureResponse,
        policy: &dyn Policy,
    ) -> ServiceResult<()> {
        if Sha256::digest(message).as_slice() != response.hash.as_slice() {
            return Err(ServiceError::Config("hash does not match message".to_string()));
        }
        verify(
            self.conode.suite(),
            &roster.publics(),
            message,
            &response.signature,
            policy,
        )
        .map_err(|e| ServiceError::Protocol(e.into()))
    }

    /// Collect and redistribute the public keys of `roster`
    pub async fn distribute_keys(&self, roster: Roster) -> ServiceResult<Vec<BlsPublicKey>> {
        let roster = Arc::new(roster);
        let root = self
            .conode
            .index_in(&roster)
            .ok_or(ServiceError::NotInRoster)?;
        let tree = Arc::new(Tree::star(roster, root)?);

        let protocol = KeyDistribution::create(&self.conode, tree).await?;
        protocol.set_timeout(self.config.timeout());
        let keys = protocol
            .keys()
            .ok_or_else(|| ServiceError::Config("keys already taken".to_string()))?;
        protocol.start()?;

        match tokio::time::timeout(self.config.timeout() + FINAL_SIGNATURE_GRACE, keys).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(ProtocolError::Finished.into()),
            Err(_) => Err(ServiceError::Timeout),
        }
    }
}

mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let hex_str = String::deserialize(d)?;
        hex::decode(hex_str).map_err(D::Error::custom)
    }
}
