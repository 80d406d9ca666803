//! Fee and reward policy.

use forgeline_types::Transaction;

/// Extra flat fee for a specific `(module, asset)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseFee {
    pub module_id: u32,
    pub asset_id: u32,
    pub amount: u64,
}

/// Minimum-fee policy: `min_fee = min_fee_per_byte * size + base_fee`.
#[derive(Debug, Clone, Default)]
pub struct FeePolicy {
    pub min_fee_per_byte: u64,
    pub base_fees: Vec<BaseFee>,
}

impl FeePolicy {
    pub fn new(min_fee_per_byte: u64, base_fees: Vec<BaseFee>) -> Self {
        Self { min_fee_per_byte, base_fees }
    }

    /// Flat fee component for a `(module, asset)` pair. Zero if unlisted.
    pub fn base_fee(&self, module_id: u32, asset_id: u32) -> u64 {
        self.base_fees
            .iter()
            .find(|f| f.module_id == module_id && f.asset_id == asset_id)
            .map(|f| f.amount)
            .unwrap_or(0)
    }

    /// The minimum acceptable fee for `tx`.
    pub fn min_fee(&self, tx: &Transaction) -> u64 {
        self.min_fee_per_byte
            .saturating_mul(tx.size() as u64)
            .saturating_add(self.base_fee(tx.module_id, tx.asset_id))
    }
}

/// Per-block reward schedule.
///
/// Rewards start at `offset` with `milestones[0]` and step down every
/// `distance` blocks; heights past the last milestone stay at the final
/// value. An empty milestone list means no rewards.
#[derive(Debug, Clone, Default)]
pub struct RewardSchedule {
    pub milestones: Vec<u64>,
    pub offset: u64,
    pub distance: u64,
}

impl RewardSchedule {
    pub fn new(milestones: Vec<u64>, offset: u64, distance: u64) -> Self {
        Self { milestones, offset, distance }
    }

    /// The block reward at `height`.
    pub fn reward_at(&self, height: u64) -> u64 {
        if self.milestones.is_empty() || height < self.offset || self.distance == 0 {
            return 0;
        }
        let step = ((height - self.offset) / self.distance) as usize;
        let index = step.min(self.milestones.len() - 1);
        self.milestones[index]
    }
}
