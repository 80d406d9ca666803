//! Network messages for the peer protocol.
//!
//! Every payload is SBOR-encoded; the encoding is part of the consensus
//! contract. Ids are binary 32-byte hashes on the wire — base64 belongs only
//! to the operator surface.

pub mod gossip;
pub mod request;
pub mod response;

pub use gossip::{BlockBroadcast, TransactionAnnouncement, TransactionBroadcast};
pub use request::{GetBlocksFromIdRequest, GetHighestCommonBlockRequest, GetTransactionsRequest};
pub use response::{BlocksFromIdResponse, HighestCommonBlockResponse, TransactionsResponse};

use forgeline_types::{Hash, PeerId};

/// Maximum number of blocks returned by a single `get_blocks_from_id` call.
pub const BLOCKS_PER_CHUNK: usize = 34;

/// A peer's view of its own chain tip, as reported by the transport layer.
///
/// The synchronizer samples these to pick a reference peer: the median of
/// `max_height_prevoted` across the sample, requiring a quorum of peers
/// agreeing on the same tip id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTip {
    pub peer: PeerId,
    pub height: u64,
    pub max_height_prevoted: u64,
    pub tip_id: Hash,
}
