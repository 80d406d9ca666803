//! Identifier newtypes.

use crate::crypto::PublicKey;
use crate::hash::{Hash, HexError};

/// A 20-byte account address, derived from the first 20 bytes of the
/// SHA-256 digest of the account public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sbor::prelude::BasicSbor)]
pub struct Address([u8; 20]);

impl Address {
    /// Number of bytes in an address.
    pub const LENGTH: usize = 20;

    /// Derive the address of a public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Hash::digest(public_key.as_bytes());
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&digest.as_bytes()[..20]);
        Address(raw)
    }

    /// Wrap raw address bytes.
    pub const fn from_raw(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s)?;
        let raw: [u8; 20] = bytes.as_slice().try_into().map_err(|_| HexError::InvalidLength {
            expected: Self::LENGTH,
            actual: bytes.len(),
        })?;
        Ok(Address(raw))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Configuration and the operator surface speak hex; binary stays internal.
impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Address::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Opaque peer identifier assigned by the transport layer.
///
/// The peer-to-peer network delivers ordered byte messages keyed by this id;
/// the node never inspects its structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}
