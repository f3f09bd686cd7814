//! Roster of participants
//!
//! The position of a member in the roster is its canonical identifier: masks,
//! tree nodes and message addressing all use the roster index.

use cosi_signer::BlsPublicKey;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// A single roster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Position in the roster
    pub index: usize,
    /// Overlay address
    pub address: String,
    /// Public key used for collective signatures
    #[serde(with = "public_hex")]
    pub public: BlsPublicKey,
}

impl ServerIdentity {
    pub fn new(address: impl Into<String>, public: BlsPublicKey) -> Self {
        Self {
            index: 0,
            address: address.into(),
            public,
        }
    }
}

/// Ordered, immutable list of participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    list: Vec<ServerIdentity>,
}

impl Roster {
    /// Build a roster, numbering members in the given order
    pub fn new(members: Vec<ServerIdentity>) -> NetworkResult<Self> {
        if members.is_empty() {
            return Err(NetworkError::InvalidRoster("empty roster".to_string()));
        }

        let mut list = members;
        for (i, member) in list.iter_mut().enumerate() {
            member.index = i;
        }

        for (i, member) in list.iter().enumerate() {
            if list[..i].iter().any(|m| m.address == member.address) {
                return Err(NetworkError::InvalidRoster(format!(
                    "duplicate address {}",
                    member.address
                )));
            }
        }

        Ok(Self { list })
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ServerIdentity> {
        self.list.get(index)
    }

    pub fn list(&self) -> &[ServerIdentity] {
        &self.list
    }

    /// Public keys in roster order
    pub fn publics(&self) -> Vec<BlsPublicKey> {
        self.list.iter().map(|si| si.public.clone()).collect()
    }

    pub fn index_of_address(&self, address: &str) -> Option<usize> {
        self.list.iter().position(|si| si.address == address)
    }

    pub fn index_of_public(&self, public: &BlsPublicKey) -> Option<usize> {
        self.list.iter().position(|si| &si.public == public)
    }
}

mod public_hex {
    use cosi_signer::BlsPublicKey;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(public: &BlsPublicKey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&public.to_hex())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BlsPublicKey, D::Error> {
        let hex_str = String::deserialize(d)?;
        BlsPublicKey::from_hex(&hex_str).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosi_signer::BlsKeyPair;

    fn identity(i: u8) -> ServerIdentity {
        let kp = BlsKeyPair::from_seed(&[i; 32]).unwrap();
        ServerIdentity::new(format!("local://conode-{}", i), kp.public)
    }

    #[test]
    fn test_roster_numbering() {
        let roster = Roster::new(vec![identity(3), identity(1), identity(2)]).unwrap();

        assert_eq!(roster.len(), 3);
        assert_eq!(roster.get(0).unwrap().address, "local://conode-3");
        assert_eq!(roster.get(2).unwrap().index, 2);
        assert_eq!(roster.index_of_address("local://conode-1"), Some(1));
        assert_eq!(roster.index_of_public(&identity(2).public), Some(2));
        assert_eq!(roster.publics().len(), 3);
    }

    #[test]
    fn test_roster_validation() {
        assert!(Roster::new(vec![]).is_err());
        assert!(Roster::new(vec![identity(1), identity(1)]).is_err());
    }

    #[test]
    fn test_roster_serialization() {
        let roster = Roster::new(vec![identity(1), identity(2)]).unwrap();
        let json = serde_json::to_string(&roster).unwrap();
        assert!(json.contains(&identity(1).public.to_hex()));

        let restored: Roster = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, roster);
    }
}
