//! Transport boundary.
//!
//! The peer-to-peer layer itself is an external collaborator: it delivers
//! ordered byte messages keyed by peer id and accepts penalties. This
//! module holds its contract ([`PeerNetwork`]), the wire codec, and the
//! [`TransportAdapter`] that turns inbound bytes into state-machine events
//! under the protocol's rate limits and penalties.

use crate::metrics;
use forgeline_core::Event;
use forgeline_messages::{
    BlockBroadcast, GetBlocksFromIdRequest, GetHighestCommonBlockRequest, GetTransactionsRequest,
    PeerTip, TransactionAnnouncement, TransactionBroadcast,
};
use forgeline_types::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Penalty for a malformed payload: immediate disconnect.
const PENALTY_MALFORMED: u32 = 100;

/// The wire codec.
///
/// ```text
/// [version: u8][payload: SBOR-encoded message]
/// ```
///
/// The message type is determined by the channel it arrives on, not by a
/// field in the payload.
pub mod codec {
    use forgeline_core::OutboundMessage;
    use thiserror::Error;

    /// Current wire format version.
    pub const WIRE_VERSION: u8 = 1;

    /// Errors from message encoding/decoding.
    #[derive(Debug, Error)]
    pub enum CodecError {
        #[error("Unknown wire version {0}")]
        UnknownVersion(u8),

        #[error("Message too short")]
        MessageTooShort,

        #[error("SBOR decode error: {0}")]
        Decode(String),
    }

    /// Encode a payload with the version prefix.
    pub fn encode_payload<T: sbor::BasicEncode>(value: &T) -> Vec<u8> {
        let payload = sbor::basic_encode(value)
            .expect("wire encoding must succeed - this is a bug if it fails");
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(WIRE_VERSION);
        bytes.extend(payload);
        bytes
    }

    /// Decode a version-prefixed payload.
    pub fn decode_payload<T: sbor::BasicDecode>(bytes: &[u8]) -> Result<T, CodecError> {
        let (&version, payload) = bytes.split_first().ok_or(CodecError::MessageTooShort)?;
        if version != WIRE_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        sbor::basic_decode(payload).map_err(|e| CodecError::Decode(format!("{e:?}")))
    }

    /// Encode an outbound broadcast.
    pub fn encode_message(message: &OutboundMessage) -> Vec<u8> {
        match message {
            OutboundMessage::Block(broadcast) => encode_payload(broadcast.as_ref()),
            OutboundMessage::TransactionAnnouncement(announcement) => encode_payload(announcement),
            OutboundMessage::Transaction(broadcast) => encode_payload(broadcast.as_ref()),
        }
    }
}

/// A peer RPC issued by the node, pre-encoded for the wire.
#[derive(Debug, Clone)]
pub enum PeerRequest {
    /// `get_blocks_from_id`; answered with a `BlocksFromIdResponse`.
    BlocksFromId(Vec<u8>),
    /// `get_highest_common_block`; answered with a `HighestCommonBlockResponse`.
    HighestCommonBlock(Vec<u8>),
    /// `get_transactions`; answered with a `TransactionsResponse`.
    Transactions(Vec<u8>),
}

/// Contract of the external peer-to-peer layer.
///
/// Implementations deliver inbound traffic as [`InboundMessage`] values on
/// a channel the runner consumes; everything here is fire-and-forget from
/// the node's perspective.
pub trait PeerNetwork: Send + Sync {
    /// Broadcast encoded bytes to all connected peers.
    fn broadcast(&self, bytes: Vec<u8>);

    /// Issue a request to one peer. The answer (or failure) comes back as
    /// an [`InboundMessage`].
    fn send_request(&self, peer: PeerId, request: PeerRequest);

    /// Ask for a fresh sample of peer tips. Answered with
    /// [`InboundMessage::NetworkTips`].
    fn request_tips(&self);

    /// Answer an inbound peer RPC.
    fn respond(&self, request_id: u64, bytes: Vec<u8>);

    /// Apply a misbehaviour penalty. 100 points disconnects the peer.
    fn penalize(&self, peer: PeerId, points: u32);

    /// Currently connected peers.
    fn connected_peers(&self) -> Vec<PeerId>;
}

/// Inbound traffic from the peer layer, still encoded.
#[derive(Debug)]
pub enum InboundMessage {
    /// `post_block` gossip.
    Block { from: PeerId, payload: Vec<u8> },
    /// `post_transaction` gossip.
    Transaction { from: PeerId, payload: Vec<u8> },
    /// `post_transactions_announcement` gossip.
    TransactionAnnouncement { from: PeerId, payload: Vec<u8> },
    /// Answer to a `get_blocks_from_id` request we issued.
    BlocksFromIdResponse { from: PeerId, payload: Vec<u8> },
    /// Answer to a `get_highest_common_block` request we issued.
    HighestCommonBlockResponse { from: PeerId, payload: Vec<u8> },
    /// Answer to a `get_transactions` request we issued.
    TransactionsResponse { from: PeerId, payload: Vec<u8> },
    /// A sample of peer tips.
    NetworkTips { tips: Vec<PeerTip> },
    /// A request we issued failed or timed out.
    RequestFailed { from: PeerId, reason: String },
    /// An inbound `get_blocks_from_id` RPC to serve.
    GetBlocksFromId { from: PeerId, request_id: u64, payload: Vec<u8> },
    /// An inbound `get_highest_common_block` RPC to serve.
    GetHighestCommonBlock { from: PeerId, request_id: u64, payload: Vec<u8> },
    /// An inbound `get_transactions` RPC to serve.
    GetTransactions { from: PeerId, request_id: u64, payload: Vec<u8> },
}

/// A decoded inbound RPC the runner must answer.
#[derive(Debug)]
pub struct ServeRequest {
    pub from: PeerId,
    pub request_id: u64,
    pub kind: ServeKind,
}

#[derive(Debug)]
pub enum ServeKind {
    BlocksFromId(GetBlocksFromIdRequest),
    HighestCommonBlock(GetHighestCommonBlockRequest),
    Transactions(GetTransactionsRequest),
}

/// What the adapter made of one inbound message.
#[derive(Debug)]
pub enum Handled {
    /// Events for the state machine.
    Events(Vec<Event>),
    /// An RPC for the runner to serve from the read view.
    Serve(ServeRequest),
    /// Dropped: malformed, over-rate, or blocked by an active sync.
    Dropped,
}

/// Rate-limit and penalty configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Announcements accepted per peer within the window.
    pub max_announcements_per_window: u32,
    /// Rate-limit window length.
    pub rate_window: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { max_announcements_per_window: 10, rate_window: Duration::from_secs(10) }
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    window_start: Option<Instant>,
    count: u32,
}

/// Translates inbound peer traffic into events, applying the protocol's
/// rate limits and penalties. Handlers never fail the process: every
/// failure becomes a drop, possibly with a penalty.
pub struct TransportAdapter {
    config: TransportConfig,
    network: Arc<dyn PeerNetwork>,
    announcement_rates: HashMap<PeerId, RateWindow>,
}

impl TransportAdapter {
    pub fn new(config: TransportConfig, network: Arc<dyn PeerNetwork>) -> Self {
        Self { config, network, announcement_rates: HashMap::new() }
    }

    /// Process one inbound message.
    ///
    /// `sync_active` mirrors the synchronizer's exclusive guard: inbound
    /// blocks are dropped at this boundary while a mechanism runs.
    pub fn handle_inbound(&mut self, message: InboundMessage, sync_active: bool) -> Handled {
        match message {
            InboundMessage::Block { from, payload } => {
                if sync_active {
                    trace!(peer = %from, "Dropping inbound block: sync active");
                    return Handled::Dropped;
                }
                match codec::decode_payload::<BlockBroadcast>(&payload) {
                    Ok(broadcast) => Handled::Events(vec![Event::BlockReceived {
                        block: Box::new(broadcast.block),
                        from,
                    }]),
                    Err(e) => self.malformed(from, "block", &e),
                }
            }
            InboundMessage::Transaction { from, payload } => {
                match codec::decode_payload::<TransactionBroadcast>(&payload) {
                    Ok(broadcast) => Handled::Events(vec![Event::TransactionReceived {
                        transaction: Box::new(broadcast.transaction),
                        from: Some(from),
                    }]),
                    Err(e) => self.malformed(from, "transaction", &e),
                }
            }
            InboundMessage::TransactionAnnouncement { from, payload } => {
                if !self.within_rate(from) {
                    debug!(peer = %from, "Dropping over-rate transaction announcement");
                    return Handled::Dropped;
                }
                match codec::decode_payload::<TransactionAnnouncement>(&payload) {
                    Ok(announcement) => Handled::Events(vec![Event::TransactionsAnnounced {
                        ids: announcement.ids,
                        from,
                    }]),
                    Err(e) => self.malformed(from, "announcement", &e),
                }
            }
            InboundMessage::BlocksFromIdResponse { from, payload } => {
                match codec::decode_payload::<forgeline_messages::BlocksFromIdResponse>(&payload) {
                    Ok(response) => Handled::Events(vec![Event::SyncBlocksReceived {
                        from,
                        blocks: response.blocks,
                    }]),
                    Err(e) => self.malformed(from, "blocks response", &e),
                }
            }
            InboundMessage::HighestCommonBlockResponse { from, payload } => {
                match codec::decode_payload::<forgeline_messages::HighestCommonBlockResponse>(
                    &payload,
                ) {
                    Ok(response) => Handled::Events(vec![Event::HighestCommonBlockReceived {
                        from,
                        id: response.id,
                    }]),
                    Err(e) => self.malformed(from, "common-block response", &e),
                }
            }
            InboundMessage::TransactionsResponse { from, payload } => {
                match codec::decode_payload::<forgeline_messages::TransactionsResponse>(&payload) {
                    Ok(response) => Handled::Events(
                        response
                            .transactions
                            .into_iter()
                            .map(|transaction| Event::TransactionReceived {
                                transaction: Box::new(transaction),
                                from: Some(from),
                            })
                            .collect(),
                    ),
                    Err(e) => self.malformed(from, "transactions response", &e),
                }
            }
            InboundMessage::NetworkTips { tips } => {
                Handled::Events(vec![Event::NetworkTipsReceived { tips }])
            }
            InboundMessage::RequestFailed { from, reason } => {
                Handled::Events(vec![Event::PeerRequestFailed { from, reason }])
            }
            InboundMessage::GetBlocksFromId { from, request_id, payload } => {
                match codec::decode_payload::<GetBlocksFromIdRequest>(&payload) {
                    Ok(request) => Handled::Serve(ServeRequest {
                        from,
                        request_id,
                        kind: ServeKind::BlocksFromId(request),
                    }),
                    Err(e) => self.malformed(from, "get_blocks_from_id", &e),
                }
            }
            InboundMessage::GetHighestCommonBlock { from, request_id, payload } => {
                match codec::decode_payload::<GetHighestCommonBlockRequest>(&payload) {
                    Ok(request) => Handled::Serve(ServeRequest {
                        from,
                        request_id,
                        kind: ServeKind::HighestCommonBlock(request),
                    }),
                    Err(e) => self.malformed(from, "get_highest_common_block", &e),
                }
            }
            InboundMessage::GetTransactions { from, request_id, payload } => {
                match codec::decode_payload::<GetTransactionsRequest>(&payload) {
                    Ok(request) => Handled::Serve(ServeRequest {
                        from,
                        request_id,
                        kind: ServeKind::Transactions(request),
                    }),
                    Err(e) => self.malformed(from, "get_transactions", &e),
                }
            }
        }
    }

    fn malformed(&self, peer: PeerId, what: &str, error: &codec::CodecError) -> Handled {
        warn!(peer = %peer, what, error = %error, "Malformed payload; penalizing peer");
        self.network.penalize(peer, PENALTY_MALFORMED);
        metrics::record_peer_penalized();
        Handled::Dropped
    }

    fn within_rate(&mut self, peer: PeerId) -> bool {
        let now = Instant::now();
        let window = self.announcement_rates.entry(peer).or_default();
        match window.window_start {
            Some(start) if now.duration_since(start) < self.config.rate_window => {
                window.count += 1;
                window.count <= self.config.max_announcements_per_window
            }
            _ => {
                window.window_start = Some(now);
                window.count = 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_types::test_utils::test_transfer;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingNetwork {
        penalties: Mutex<Vec<(PeerId, u32)>>,
    }

    impl PeerNetwork for RecordingNetwork {
        fn broadcast(&self, _bytes: Vec<u8>) {}
        fn send_request(&self, _peer: PeerId, _request: PeerRequest) {}
        fn request_tips(&self) {}
        fn respond(&self, _request_id: u64, _bytes: Vec<u8>) {}
        fn penalize(&self, peer: PeerId, points: u32) {
            self.penalties.lock().push((peer, points));
        }
        fn connected_peers(&self) -> Vec<PeerId> {
            Vec::new()
        }
    }

    fn adapter() -> (TransportAdapter, Arc<RecordingNetwork>) {
        let network = Arc::new(RecordingNetwork::default());
        (
            TransportAdapter::new(TransportConfig::default(), network.clone()),
            network,
        )
    }

    #[test]
    fn malformed_payload_costs_one_hundred_points() {
        let (mut adapter, network) = adapter();
        let handled = adapter.handle_inbound(
            InboundMessage::Block { from: PeerId(5), payload: vec![codec::WIRE_VERSION, 0xff] },
            false,
        );
        assert!(matches!(handled, Handled::Dropped));
        assert_eq!(*network.penalties.lock(), vec![(PeerId(5), 100)]);
    }

    #[test]
    fn unknown_wire_version_is_malformed() {
        let (mut adapter, network) = adapter();
        let tx = test_transfer(1, 2, 0, 100);
        let mut payload = codec::encode_payload(&TransactionBroadcast { transaction: tx });
        payload[0] = 9;
        let handled = adapter.handle_inbound(
            InboundMessage::Transaction { from: PeerId(2), payload },
            false,
        );
        assert!(matches!(handled, Handled::Dropped));
        assert_eq!(network.penalties.lock().len(), 1);
    }

    #[test]
    fn blocks_are_dropped_while_syncing() {
        let (mut adapter, network) = adapter();
        let handled = adapter.handle_inbound(
            InboundMessage::Block { from: PeerId(1), payload: vec![codec::WIRE_VERSION] },
            true,
        );
        assert!(matches!(handled, Handled::Dropped));
        // Dropped by the guard, not penalized as malformed.
        assert!(network.penalties.lock().is_empty());
    }

    #[test]
    fn transactions_decode_into_events() {
        let (mut adapter, _) = adapter();
        let tx = test_transfer(1, 2, 0, 100);
        let payload = codec::encode_payload(&TransactionBroadcast { transaction: tx.clone() });
        let handled = adapter.handle_inbound(
            InboundMessage::Transaction { from: PeerId(3), payload },
            false,
        );
        match handled {
            Handled::Events(events) => match events.as_slice() {
                [Event::TransactionReceived { transaction, from: Some(PeerId(3)) }] => {
                    assert_eq!(transaction.id(), tx.id());
                }
                other => panic!("unexpected events: {other:?}"),
            },
            other => panic!("expected events, got {other:?}"),
        }
    }

    #[test]
    fn over_rate_announcements_are_dropped_without_penalty() {
        let (mut adapter, network) = adapter();
        let payload = codec::encode_payload(&TransactionAnnouncement { ids: Vec::new() });
        let limit = TransportConfig::default().max_announcements_per_window;

        for _ in 0..limit {
            let handled = adapter.handle_inbound(
                InboundMessage::TransactionAnnouncement {
                    from: PeerId(4),
                    payload: payload.clone(),
                },
                false,
            );
            assert!(matches!(handled, Handled::Events(_)));
        }
        let handled = adapter.handle_inbound(
            InboundMessage::TransactionAnnouncement { from: PeerId(4), payload },
            false,
        );
        assert!(matches!(handled, Handled::Dropped));
        assert!(network.penalties.lock().is_empty());
    }

    #[test]
    fn inbound_rpcs_become_serve_requests() {
        let (mut adapter, _) = adapter();
        let payload = codec::encode_payload(&GetTransactionsRequest { ids: Vec::new() });
        let handled = adapter.handle_inbound(
            InboundMessage::GetTransactions { from: PeerId(6), request_id: 42, payload },
            false,
        );
        match handled {
            Handled::Serve(request) => {
                assert_eq!(request.request_id, 42);
                assert!(matches!(request.kind, ServeKind::Transactions(_)));
            }
            other => panic!("expected a serve request, got {other:?}"),
        }
    }

    #[test]
    fn payload_codec_round_trip() {
        let tx = test_transfer(3, 4, 1, 250);
        let payload = codec::encode_payload(&TransactionBroadcast { transaction: tx.clone() });
        let decoded: TransactionBroadcast = codec::decode_payload(&payload).unwrap();
        assert_eq!(decoded.transaction, tx);
    }
}
