//! Outbound network messages.

use forgeline_messages::{BlockBroadcast, TransactionAnnouncement, TransactionBroadcast};

/// Messages the node broadcasts to its peers.
///
/// Request/response RPCs are not listed here; they are issued through the
/// dedicated request actions so the transport can correlate replies.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// `post_block`: a freshly forged or applied block.
    Block(Box<BlockBroadcast>),
    /// `post_transactions_announcement`: batched transaction ids.
    TransactionAnnouncement(TransactionAnnouncement),
    /// `post_transaction`: a full transaction.
    Transaction(Box<TransactionBroadcast>),
}

impl OutboundMessage {
    /// The message type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Block(_) => "Block",
            OutboundMessage::TransactionAnnouncement(_) => "TransactionAnnouncement",
            OutboundMessage::Transaction(_) => "Transaction",
        }
    }
}
