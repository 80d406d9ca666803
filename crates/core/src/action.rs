//! Action types for the node state machine.

use crate::{ChainEvent, Event, OutboundMessage, TimerId};
use forgeline_types::{Hash, PeerId};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** — they describe something to do. The runner
/// executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to all connected peers.
    Broadcast { message: OutboundMessage },

    /// Ask the transport for a sample of peer tips.
    ///
    /// Returns [`Event::NetworkTipsReceived`] when the sample is in.
    RequestNetworkTips,

    /// Probe a peer for the highest block id it shares with us.
    ///
    /// Returns [`Event::HighestCommonBlockReceived`].
    RequestHighestCommonBlock { from: PeerId, ids: Vec<Hash> },

    /// Request one chunk of blocks following `block_id` from a peer.
    ///
    /// Returns [`Event::SyncBlocksReceived`].
    RequestBlocksFromId { from: PeerId, block_id: Hash },

    /// Fetch full transactions for announced ids.
    ///
    /// Returns [`Event::TransactionReceived`] per transaction.
    RequestTransactions { from: PeerId, ids: Vec<Hash> },

    /// Apply a misbehaviour penalty to a peer. 100 points disconnects.
    PenalizePeer { peer: PeerId, points: u32 },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for processing before the next external
    /// input, preserving causality.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // External notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Publish a notification on the observer bus.
    Emit { event: ChainEvent },
}

impl Action {
    /// The action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::RequestNetworkTips => "RequestNetworkTips",
            Action::RequestHighestCommonBlock { .. } => "RequestHighestCommonBlock",
            Action::RequestBlocksFromId { .. } => "RequestBlocksFromId",
            Action::RequestTransactions { .. } => "RequestTransactions",
            Action::PenalizePeer { .. } => "PenalizePeer",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::Emit { .. } => "Emit",
        }
    }

    /// Whether this action feeds an event back into the state machine.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }
}
