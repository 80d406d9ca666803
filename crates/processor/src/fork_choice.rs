//! Fork choice.
//!
//! Pure decision over a received block versus the current tip. The rules are
//! evaluated strictly in order; the tiebreak is total and antisymmetric, so
//! every node resolves a same-height contest identically.

use forgeline_types::{BlockHeader, Hash};

/// What to do with a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkDecision {
    /// Extends the tip: run the full pipeline.
    Append,
    /// Same-height tiebreak win: move the tip to the temp region and apply
    /// the candidate.
    Replace,
    /// One-block divergence from the same generator: fast chain switch.
    SyncFastChainSwitch,
    /// Far ahead of the tip: block synchronization.
    SyncBlockSync,
    /// At or below the finalized height: irreparable fork attempt.
    DiscardIrrecoverable,
    /// Stale, duplicate, or a tiebreak loss.
    Discard,
}

/// Whether `candidate` beats `incumbent` in a same-height contest:
/// higher `max_height_prevoted`, then lower id lexicographic.
pub fn tiebreak_wins(
    candidate: &BlockHeader,
    candidate_id: &Hash,
    incumbent: &BlockHeader,
    incumbent_id: &Hash,
) -> bool {
    match candidate
        .asset
        .max_height_prevoted
        .cmp(&incumbent.asset.max_height_prevoted)
    {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate_id < incumbent_id,
    }
}

/// Decide what to do with `candidate` given the current tip.
pub fn choose(
    candidate: &BlockHeader,
    last: &BlockHeader,
    last_id: &Hash,
    finalized_height: u64,
) -> ForkDecision {
    if candidate.previous_block_id == *last_id {
        return ForkDecision::Append;
    }

    let candidate_id = candidate.id();
    if candidate.height == last.height
        && candidate.previous_block_id == last.previous_block_id
    {
        return if tiebreak_wins(candidate, &candidate_id, last, last_id) {
            ForkDecision::Replace
        } else {
            ForkDecision::Discard
        };
    }

    if candidate.height == last.height + 1
        && candidate.generator_public_key == last.generator_public_key
    {
        return ForkDecision::SyncFastChainSwitch;
    }

    if candidate.height > last.height + 1 {
        return ForkDecision::SyncBlockSync;
    }

    if candidate.height <= finalized_height {
        return ForkDecision::DiscardIrrecoverable;
    }

    ForkDecision::Discard
}
