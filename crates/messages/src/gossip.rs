//! Gossip payloads: fire-and-forget broadcasts.

use forgeline_types::{Block, Hash, Transaction};

/// A freshly applied or forged block, pushed to peers (`post_block`).
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlockBroadcast {
    pub block: Block,
}

/// Batched announcement of transaction ids (`post_transactions_announcement`).
///
/// Peers that do not know an announced id fetch the full transaction with
/// [`crate::GetTransactionsRequest`], subject to their own rate limits.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct TransactionAnnouncement {
    pub ids: Vec<Hash>,
}

/// A full transaction pushed directly (`post_transaction`).
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct TransactionBroadcast {
    pub transaction: Transaction,
}
