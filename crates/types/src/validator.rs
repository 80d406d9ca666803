//! Active validator set for one round.

use crate::identifiers::Address;

/// The ordered delegate set for one round of slots.
///
/// Computed deterministically from account votes at the round boundary and
/// rotated every `round_length` blocks. Slot-to-forger assignment is a plain
/// modulo over the member list, so every node derives the same schedule.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct ValidatorSet {
    /// The round this set is active for.
    pub round: u64,
    /// Ordered delegate addresses.
    pub members: Vec<Address>,
}

impl ValidatorSet {
    pub fn new(round: u64, members: Vec<Address>) -> Self {
        Self { round, members }
    }

    /// Number of active validators.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The delegate assigned to forge in `slot`.
    pub fn generator_at(&self, slot: u64) -> Option<Address> {
        if self.members.is_empty() {
            return None;
        }
        let index = (slot % self.members.len() as u64) as usize;
        Some(self.members[index])
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    /// The supermajority threshold for this set: the smallest count strictly
    /// greater than two thirds of the membership.
    pub fn two_thirds_threshold(&self) -> usize {
        self.members.len() * 2 / 3 + 1
    }
}
