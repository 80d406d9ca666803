//! 32-byte SHA-256 hash primitive.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Error parsing a hash from a hex string.
#[derive(Debug, Error, PartialEq)]
pub enum HexError {
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A 32-byte hash.
///
/// Block ids, transaction ids and merkle roots are all SHA-256 digests. Ids
/// are binary everywhere inside the node; hex belongs to the operator surface.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sbor::prelude::BasicSbor)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero hash. Used as the previous-block id of genesis.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Number of bytes in a hash.
    pub const LENGTH: usize = 32;

    /// Compute the SHA-256 digest of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Wrap raw hash bytes without hashing.
    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Wrap a raw byte slice without hashing.
    ///
    /// Returns `None` if the slice is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash(raw))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s)?;
        let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| HexError::InvalidLength {
            expected: Self::LENGTH,
            actual: bytes.len(),
        })?;
        Ok(Hash(raw))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
