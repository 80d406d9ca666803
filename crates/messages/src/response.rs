//! Peer RPC responses.

use forgeline_types::{Block, Hash, Transaction};

/// Response to [`crate::GetBlocksFromIdRequest`]: blocks in ascending height
/// order, at most [`crate::BLOCKS_PER_CHUNK`] of them.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlocksFromIdResponse {
    pub blocks: Vec<Block>,
}

/// Response to [`crate::GetHighestCommonBlockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct HighestCommonBlockResponse {
    pub id: Option<Hash>,
}

/// Response to [`crate::GetTransactionsRequest`].
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct TransactionsResponse {
    pub transactions: Vec<Transaction>,
}
