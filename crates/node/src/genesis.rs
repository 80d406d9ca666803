//! Genesis block construction.

use forgeline_types::{merkle_root, Block, BlockAsset, BlockHeader, Hash, PublicKey, Signature};

/// Build a genesis block for the given timestamp.
///
/// Genesis carries no payload and no meaningful generator: it is persisted
/// by `Chain::init` without passing the validation pipeline, and its id
/// anchors `previous_block_id` for height 1. The initial account state is
/// persisted alongside it, not inside it.
pub fn create_genesis_block(timestamp: u32) -> Block {
    Block {
        header: BlockHeader {
            version: 2,
            height: 0,
            timestamp,
            previous_block_id: Hash::ZERO,
            generator_public_key: PublicKey::from_raw([0u8; 32]),
            transaction_root: merkle_root(&[]),
            asset: BlockAsset::genesis(),
            signature: Signature::zero(),
        },
        payload: Vec::new(),
    }
}
