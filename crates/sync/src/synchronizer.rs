//! Mechanism selection and the two recovery flows.

use forgeline_core::Action;
use forgeline_messages::PeerTip;
use forgeline_processor::BlockProcessor;
use forgeline_types::{Block, Hash, PeerId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Peer penalty for serving a fork below the finalized height or an
/// otherwise poisoned sync response.
const PENALTY_IRRECOVERABLE: u32 = 100;

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum peers that must agree on one tip id before it is trusted as
    /// the reference chain.
    pub min_tip_agreement: usize,
    /// Bounded retries per chunk or request before the mechanism aborts.
    pub max_retries: u32,
    /// Slots per round; bounds the fast-switch distance.
    pub round_length: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { min_tip_agreement: 3, max_retries: 3, round_length: 103 }
    }
}

/// The two recovery mechanisms, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    FastChainSwitch,
    BlockSync,
}

impl Mechanism {
    /// Whether this mechanism applies to the received block, evaluated in
    /// registration order; the first match runs.
    fn is_valid_for(self, block: &Block, tip_height: u64, round_length: u64) -> bool {
        match self {
            // A small reorganization: the candidate is within two rounds of
            // the tip, on either side.
            Mechanism::FastChainSwitch => {
                block.height().abs_diff(tip_height) <= 2 * round_length
            }
            // Far behind the network.
            Mechanism::BlockSync => block.height() > tip_height + 1,
        }
    }
}

/// What the synchronizer is currently waiting for.
#[derive(Debug)]
enum Phase {
    /// Waiting for a sample of peer tips ([`Action::RequestNetworkTips`]).
    SelectingPeer { trigger_height: u64 },
    /// Waiting for a highest-common-block probe answer.
    FindingCommonBlock {
        mechanism: Mechanism,
        peer: PeerId,
        target_height: u64,
    },
    /// Waiting for the next chunk of blocks.
    Requesting {
        mechanism: Mechanism,
        peer: PeerId,
        target_height: u64,
        /// The height reverted to; the restore point on failure.
        common_height: u64,
        retries: u32,
    },
}

/// The synchronizer.
///
/// Exactly one mechanism runs at a time; `is_active` is the exclusive guard
/// the rest of the node consults.
pub struct Synchronizer {
    config: SyncConfig,
    active: Option<Phase>,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self { config, active: None }
    }

    /// Whether a mechanism is currently running.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Abort the in-flight mechanism at the next chunk boundary. The chain
    /// is already consistent: chunks apply block-by-block through the undo
    /// journal.
    pub fn cancel(&mut self) {
        if self.active.take().is_some() {
            info!("Sync cancelled");
        }
    }

    /// Entry point: a recoverable divergence was detected by the processor.
    pub fn on_sync_required(
        &mut self,
        block: Block,
        peer: PeerId,
        processor: &mut BlockProcessor,
    ) -> Vec<Action> {
        if self.active.is_some() {
            debug!("Sync already active; ignoring trigger");
            return Vec::new();
        }

        let tip_height = processor.chain().last_block().height();
        let mechanism = [Mechanism::FastChainSwitch, Mechanism::BlockSync]
            .into_iter()
            .find(|m| m.is_valid_for(&block, tip_height, self.config.round_length));
        let Some(mechanism) = mechanism else {
            debug!(height = block.height(), "No mechanism applies; dropping trigger");
            return Vec::new();
        };

        info!(?mechanism, trigger_height = block.height(), peer = %peer, "Starting sync");
        match mechanism {
            Mechanism::FastChainSwitch => {
                self.active = Some(Phase::FindingCommonBlock {
                    mechanism,
                    peer,
                    target_height: block.height(),
                });
                match processor.chain().common_block_probe_ids() {
                    Ok(ids) => vec![Action::RequestHighestCommonBlock { from: peer, ids }],
                    Err(e) => {
                        warn!(error = %e, "Failed to assemble probe ids");
                        self.active = None;
                        Vec::new()
                    }
                }
            }
            Mechanism::BlockSync => {
                self.active = Some(Phase::SelectingPeer { trigger_height: block.height() });
                vec![Action::RequestNetworkTips]
            }
        }
    }

    /// A sample of peer tips arrived; pick the reference peer.
    ///
    /// The reference chain is the tip id at least `min_tip_agreement` peers
    /// agree on, ranked by the median declared `max_height_prevoted`
    /// (height as tiebreak). No qualifying group aborts the mechanism.
    pub fn on_network_tips(
        &mut self,
        tips: Vec<PeerTip>,
        processor: &mut BlockProcessor,
    ) -> Vec<Action> {
        let Some(Phase::SelectingPeer { trigger_height }) = &self.active else {
            return Vec::new();
        };
        debug!(trigger_height, sample = tips.len(), "Selecting reference peer");

        let mut groups: HashMap<Hash, Vec<&PeerTip>> = HashMap::new();
        for tip in &tips {
            groups.entry(tip.tip_id).or_default().push(tip);
        }

        let mut best: Option<(u64, u64, &Vec<&PeerTip>)> = None;
        for group in groups.values() {
            if group.len() < self.config.min_tip_agreement {
                continue;
            }
            let mut prevoted: Vec<u64> = group.iter().map(|t| t.max_height_prevoted).collect();
            prevoted.sort_unstable();
            let median = prevoted[prevoted.len() / 2];
            let height = group.iter().map(|t| t.height).max().unwrap_or(0);
            if best.map(|(m, h, _)| (median, height) > (m, h)).unwrap_or(true) {
                best = Some((median, height, group));
            }
        }

        let Some((median, target_height, group)) = best else {
            warn!(sample = tips.len(), "No tip with enough peer agreement; aborting sync");
            self.active = None;
            return Vec::new();
        };

        // Deterministic reference peer within the winning group.
        let peer = group.iter().map(|t| t.peer).min().expect("group is non-empty");
        debug!(peer = %peer, median, target_height, "Reference peer selected");
        self.active = Some(Phase::FindingCommonBlock {
            mechanism: Mechanism::BlockSync,
            peer,
            target_height,
        });
        match processor.chain().common_block_probe_ids() {
            Ok(ids) => vec![Action::RequestHighestCommonBlock { from: peer, ids }],
            Err(e) => {
                warn!(error = %e, "Failed to assemble probe ids");
                self.active = None;
                Vec::new()
            }
        }
    }

    /// The probe answer arrived; revert to the common block and start
    /// requesting the peer's chain.
    pub fn on_highest_common_block(
        &mut self,
        from: PeerId,
        id: Option<Hash>,
        processor: &mut BlockProcessor,
    ) -> Vec<Action> {
        let Some(Phase::FindingCommonBlock { mechanism, peer, target_height }) = &self.active
        else {
            return Vec::new();
        };
        let (mechanism, peer, target_height) = (*mechanism, *peer, *target_height);
        if from != peer {
            return Vec::new();
        }

        let Some(common_id) = id else {
            warn!(peer = %peer, "Peer shares no common block; aborting sync");
            self.active = None;
            return vec![Action::PenalizePeer { peer, points: PENALTY_IRRECOVERABLE }];
        };

        let common = match processor.chain().data_access().get_block_by_id(&common_id) {
            Ok(Some(block)) => block,
            Ok(None) => {
                warn!(peer = %peer, id = %common_id, "Peer answered with an unknown block");
                self.active = None;
                return vec![Action::PenalizePeer { peer, points: PENALTY_IRRECOVERABLE }];
            }
            Err(e) => {
                warn!(error = %e, "Storage failure during sync");
                self.active = None;
                return Vec::new();
            }
        };

        let finalized = processor.chain().finalized_height();
        if common.height() < finalized {
            // Reaching the peer's chain would revert a finalized block.
            warn!(
                common = common.height(),
                finalized,
                peer = %peer,
                "Irrecoverable fork: common block below finalized height"
            );
            self.active = None;
            return vec![Action::PenalizePeer { peer, points: PENALTY_IRRECOVERABLE }];
        }

        if mechanism == Mechanism::FastChainSwitch {
            let distance = target_height.abs_diff(common.height());
            if distance > 2 * self.config.round_length {
                warn!(distance, "Fast chain switch distance bound exceeded; aborting");
                self.active = None;
                return vec![Action::PenalizePeer { peer, points: PENALTY_IRRECOVERABLE }];
            }
        }

        let mut actions = match self.revert_to(common.height(), processor) {
            Ok(actions) => actions,
            Err(actions) => {
                self.active = None;
                return actions;
            }
        };

        info!(common = common.height(), target = target_height, "Reverted to common block");
        self.active = Some(Phase::Requesting {
            mechanism,
            peer,
            target_height,
            common_height: common.height(),
            retries: 0,
        });
        actions.push(Action::RequestBlocksFromId { from: peer, block_id: common_id });
        actions
    }

    /// One chunk of blocks arrived; apply it and request the next, finish,
    /// or restore on failure.
    pub fn on_sync_blocks(
        &mut self,
        from: PeerId,
        blocks: Vec<Block>,
        processor: &mut BlockProcessor,
    ) -> Vec<Action> {
        let Some(Phase::Requesting { mechanism, peer, target_height, common_height, retries }) =
            &self.active
        else {
            return Vec::new();
        };
        let (mechanism, peer, target_height, common_height, retries) =
            (*mechanism, *peer, *target_height, *common_height, *retries);
        if from != peer {
            return Vec::new();
        }

        if blocks.is_empty() {
            return self.retry_chunk(peer, retries, common_height, processor, "empty chunk");
        }

        let mut actions = Vec::new();
        for block in blocks {
            match processor.process_validated(block) {
                Ok(mut block_actions) => actions.append(&mut block_actions),
                Err(e) => {
                    warn!(error = %e, peer = %peer, "Chunk application failed; restoring chain");
                    actions.extend(self.restore(common_height, processor));
                    actions.push(Action::PenalizePeer { peer, points: PENALTY_IRRECOVERABLE });
                    self.active = None;
                    return actions;
                }
            }
        }

        let tip = processor.chain().last_block().height();
        if tip >= target_height {
            info!(tip, "Sync complete");
            if let Err(e) = processor.chain().clear_temp() {
                warn!(error = %e, "Failed to clear temp region after sync");
            }
            self.active = None;
            return actions;
        }

        // Next chunk, from the new tip.
        self.active = Some(Phase::Requesting {
            mechanism,
            peer,
            target_height,
            common_height,
            retries: 0,
        });
        actions.push(Action::RequestBlocksFromId {
            from: peer,
            block_id: processor.chain().last_block().id(),
        });
        actions
    }

    /// A request to the reference peer failed at the transport layer.
    pub fn on_request_failed(
        &mut self,
        from: PeerId,
        reason: &str,
        processor: &mut BlockProcessor,
    ) -> Vec<Action> {
        match &self.active {
            Some(Phase::FindingCommonBlock { peer, .. }) if *peer == from => {
                warn!(peer = %from, reason, "Common-block probe failed; aborting sync");
                self.active = None;
                Vec::new()
            }
            Some(Phase::Requesting { peer, retries, common_height, .. }) if *peer == from => {
                let (retries, common_height) = (*retries, *common_height);
                self.retry_chunk(from, retries, common_height, processor, reason)
            }
            Some(Phase::SelectingPeer { .. }) => {
                warn!(reason, "Tip sampling failed; aborting sync");
                self.active = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn retry_chunk(
        &mut self,
        peer: PeerId,
        retries: u32,
        common_height: u64,
        processor: &mut BlockProcessor,
        reason: &str,
    ) -> Vec<Action> {
        if retries + 1 >= self.config.max_retries {
            warn!(peer = %peer, reason, "Chunk retries exhausted; aborting sync");
            let mut actions = self.restore(common_height, processor);
            actions.push(Action::PenalizePeer { peer, points: PENALTY_IRRECOVERABLE });
            self.active = None;
            return actions;
        }
        if let Some(Phase::Requesting { retries: r, .. }) = &mut self.active {
            *r += 1;
        }
        debug!(peer = %peer, attempt = retries + 1, reason, "Retrying sync chunk");
        vec![Action::RequestBlocksFromId {
            from: peer,
            block_id: processor.chain().last_block().id(),
        }]
    }

    /// Revert the tip down to `height`, parking reverted blocks in the temp
    /// region. Never crosses the finalized height. The collected revert
    /// actions carry the `BlockReverted` events the pool re-admits from.
    fn revert_to(
        &mut self,
        height: u64,
        processor: &mut BlockProcessor,
    ) -> Result<Vec<Action>, Vec<Action>> {
        let mut actions = Vec::new();
        while processor.chain().last_block().height() > height {
            debug_assert!(
                processor.chain().last_block().height() > processor.chain().finalized_height(),
                "revert may never cross the finalized height"
            );
            match processor.delete_last_block(true) {
                Ok(mut delete_actions) => actions.append(&mut delete_actions),
                Err(e) => {
                    warn!(error = %e, "Revert failed during sync");
                    return Err(actions);
                }
            }
        }
        Ok(actions)
    }

    /// Restore the pre-sync chain: revert any partially applied peer blocks
    /// and replay the parked originals from the temp region.
    fn restore(&mut self, common_height: u64, processor: &mut BlockProcessor) -> Vec<Action> {
        let mut actions = Vec::new();
        while processor.chain().last_block().height() > common_height {
            match processor.delete_last_block(false) {
                Ok(mut delete_actions) => actions.append(&mut delete_actions),
                Err(e) => {
                    warn!(error = %e, "Restore revert failed");
                    return actions;
                }
            }
        }
        match processor.chain().temp_blocks() {
            Ok(parked) => actions.extend(processor.replay_temp_blocks(parked)),
            Err(e) => warn!(error = %e, "Could not read temp region during restore"),
        }
        actions
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("active", &self.active)
            .finish()
    }
}
