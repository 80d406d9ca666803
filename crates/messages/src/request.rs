//! Peer RPC requests.

use forgeline_types::Hash;

/// Ask a peer for up to [`crate::BLOCKS_PER_CHUNK`] blocks following a known
/// block id, ordered by ascending height.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetBlocksFromIdRequest {
    pub block_id: Hash,
}

/// Probe a peer with a descending list of our block ids; the peer answers
/// with the highest one it also has.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetHighestCommonBlockRequest {
    pub ids: Vec<Hash>,
}

/// Fetch full transactions for previously announced ids.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetTransactionsRequest {
    pub ids: Vec<Hash>,
}
