//! Event types for the node state machine.

use forgeline_messages::PeerTip;
use forgeline_types::{Address, Block, Hash, PeerId, Transaction};

/// Priority levels for event ordering within the same tick.
///
/// Events queued at the same time are processed in priority order. Internal
/// events (consequences of prior processing) are handled before new external
/// inputs, preserving causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing. Processed first.
    Internal = 0,
    /// Timers scheduled by the node itself.
    Timer = 1,
    /// External inputs from peers.
    Network = 2,
    /// External inputs from the operator surface.
    Operator = 3,
}

/// Why a transaction left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Included in an applied block.
    Included,
    /// Older than the expiry interval.
    Expired,
    /// Evicted to make room for a better-paying transaction.
    Evicted,
    /// Replaced by a same-nonce transaction paying the replacement premium.
    Replaced,
    /// Nonce already consumed on chain.
    StaleNonce,
}

/// Notifications observers subscribe to.
///
/// This is the whole public event surface of the node core; components
/// communicate through [`Event`]/[`super::Action`] channels, never through
/// shared emitters.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was applied and is the new tip.
    NewBlock { block: Box<Block> },
    /// The tip block was reverted.
    DeleteBlock { block: Box<Block> },
    /// The finalized height advanced.
    BlockFinalized { height: u64 },
    /// The active validator set rotated to a new round.
    ValidatorsChanged { round: u64 },
    /// A transaction left the pool.
    TransactionRemoved { id: Hash, reason: RemovalReason },
}

/// All possible inputs to the node state machine.
///
/// Events are **passive data** — they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Time to attempt a forge (cooperative tick).
    ForgeTick,

    /// Time to sweep expired transactions from the pool.
    PoolSweepTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network inputs (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A peer pushed a block (`post_block`).
    BlockReceived { block: Box<Block>, from: PeerId },

    /// A peer pushed a full transaction (`post_transaction`), or the
    /// transport fetched one we previously saw announced (`from` is `None`
    /// for operator submissions).
    TransactionReceived {
        transaction: Box<Transaction>,
        from: Option<PeerId>,
    },

    /// A peer announced transaction ids (`post_transactions_announcement`).
    TransactionsAnnounced { ids: Vec<Hash>, from: PeerId },

    /// Transport delivered a sample of peer tips (reply to
    /// [`super::Action::RequestNetworkTips`]).
    NetworkTipsReceived { tips: Vec<PeerTip> },

    /// A peer answered a highest-common-block probe.
    HighestCommonBlockReceived { from: PeerId, id: Option<Hash> },

    /// A peer answered a blocks-from-id request with one chunk.
    SyncBlocksReceived { from: PeerId, blocks: Vec<Block> },

    /// A peer request timed out or failed at the transport layer.
    PeerRequestFailed { from: PeerId, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Operator inputs (priority: Operator)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enable or disable forging for a local delegate.
    UpdateForgingStatus {
        address: Address,
        password: String,
        enabled: bool,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal events (priority: Internal)
    // These replace direct calls between components.
    // ═══════════════════════════════════════════════════════════════════════
    /// The forger produced a block for the current slot.
    LocalBlockForged { block: Box<Block> },

    /// The processor detected a recoverable divergence; the synchronizer
    /// selects and drives a recovery mechanism.
    SyncRequired { block: Box<Block>, peer: PeerId },

    /// A block was applied. Consumed by the pool (eviction) and forger.
    BlockApplied { block: Box<Block> },

    /// The tip block was reverted. Consumed by the pool (re-admission).
    BlockReverted { block: Box<Block> },

    /// The finalized height advanced.
    FinalityAdvanced { height: u64 },

    /// The active validator set rotated.
    RoundChanged { round: u64 },
}

impl Event {
    /// The priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::LocalBlockForged { .. }
            | Event::SyncRequired { .. }
            | Event::BlockApplied { .. }
            | Event::BlockReverted { .. }
            | Event::FinalityAdvanced { .. }
            | Event::RoundChanged { .. } => EventPriority::Internal,

            Event::ForgeTick | Event::PoolSweepTimer => EventPriority::Timer,

            Event::BlockReceived { .. }
            | Event::TransactionReceived { .. }
            | Event::TransactionsAnnounced { .. }
            | Event::NetworkTipsReceived { .. }
            | Event::HighestCommonBlockReceived { .. }
            | Event::SyncBlocksReceived { .. }
            | Event::PeerRequestFailed { .. } => EventPriority::Network,

            Event::UpdateForgingStatus { .. } => EventPriority::Operator,
        }
    }

    /// The event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ForgeTick => "ForgeTick",
            Event::PoolSweepTimer => "PoolSweepTimer",
            Event::BlockReceived { .. } => "BlockReceived",
            Event::TransactionReceived { .. } => "TransactionReceived",
            Event::TransactionsAnnounced { .. } => "TransactionsAnnounced",
            Event::NetworkTipsReceived { .. } => "NetworkTipsReceived",
            Event::HighestCommonBlockReceived { .. } => "HighestCommonBlockReceived",
            Event::SyncBlocksReceived { .. } => "SyncBlocksReceived",
            Event::PeerRequestFailed { .. } => "PeerRequestFailed",
            Event::UpdateForgingStatus { .. } => "UpdateForgingStatus",
            Event::LocalBlockForged { .. } => "LocalBlockForged",
            Event::SyncRequired { .. } => "SyncRequired",
            Event::BlockApplied { .. } => "BlockApplied",
            Event::BlockReverted { .. } => "BlockReverted",
            Event::FinalityAdvanced { .. } => "FinalityAdvanced",
            Event::RoundChanged { .. } => "RoundChanged",
        }
    }

    /// Whether this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }
}
