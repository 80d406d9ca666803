//! Block and block header containers.

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::hash::Hash;
use crate::transaction::Transaction;

/// Consensus metadata the generator declares in the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlockAsset {
    /// The largest height this generator had forged before this block.
    pub max_height_previously_forged: u64,
    /// The height this generator asserts as prevoted.
    pub max_height_prevoted: u64,
    /// Hash-onion layer disclosed for this forging slot.
    pub seed_reveal: [u8; 16],
}

impl BlockAsset {
    /// Asset for a genesis block: no prior forging, nothing prevoted.
    pub fn genesis() -> Self {
        Self {
            max_height_previously_forged: 0,
            max_height_prevoted: 0,
            seed_reveal: [0u8; 16],
        }
    }
}

/// A block header.
///
/// The id is the SHA-256 digest of the SBOR-encoded header (including the
/// signature) and is computed, never transmitted or stored inside the header.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlockHeader {
    /// Header schema version.
    pub version: u32,
    /// Height, strictly increasing from the genesis height.
    pub height: u64,
    /// Unix timestamp in seconds. Must fall inside the generator's slot.
    pub timestamp: u32,
    /// Id of the parent block. Zero for genesis.
    pub previous_block_id: Hash,
    /// Public key of the forging delegate.
    pub generator_public_key: PublicKey,
    /// Merkle root over the payload transaction ids.
    pub transaction_root: Hash,
    /// Consensus metadata declared by the generator.
    pub asset: BlockAsset,
    /// Generator signature over the unsigned header bytes.
    pub signature: Signature,
}

impl BlockHeader {
    /// The block id: digest of the full encoded header.
    pub fn id(&self) -> Hash {
        let bytes = sbor::basic_encode(self)
            .expect("header encoding must succeed - this is a bug if it fails");
        Hash::digest(&bytes)
    }

    /// The bytes the generator signs: the header with a zeroed signature.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Signature::zero();
        sbor::basic_encode(&unsigned)
            .expect("header encoding must succeed - this is a bug if it fails")
    }

    /// Sign the header with the generator keypair.
    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = keypair.sign(&self.unsigned_bytes());
    }

    /// Verify the header signature under `generator_public_key`.
    pub fn verify_signature(&self) -> bool {
        self.generator_public_key
            .verify(&self.unsigned_bytes(), &self.signature)
    }
}

/// A block: header plus ordered transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<Transaction>,
}

impl Block {
    /// The block id.
    pub fn id(&self) -> Hash {
        self.header.id()
    }

    /// The block height.
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Merkle root over the payload's transaction ids.
    pub fn compute_transaction_root(&self) -> Hash {
        let ids: Vec<Hash> = self.payload.iter().map(|tx| tx.id()).collect();
        merkle_root(&ids)
    }

    /// Total encoded size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload.iter().map(|tx| tx.size()).sum()
    }
}

/// Merkle root over a list of leaf hashes.
///
/// Pairs are combined with SHA-256 over the concatenated bytes; an odd node
/// is promoted unchanged. The empty list hashes to the digest of no bytes so
/// that an empty payload still commits to a well-known value.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::digest(&[]);
    }
    let mut layer: Vec<Hash> = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            if pair.len() == 2 {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(pair[0].as_bytes());
                buf[32..].copy_from_slice(pair[1].as_bytes());
                next.push(Hash::digest(&buf));
            } else {
                next.push(pair[0]);
            }
        }
        layer = next;
    }
    layer[0]
}
