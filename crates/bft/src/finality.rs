//! Finality derivation from header-implied votes.

use forgeline_types::{Address, BlockHeader, ValidatorSet};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the header update rule.
///
/// Both kinds mean the generator contradicted its own history; the block is
/// dropped and, for peer-origin blocks, the peer penalized.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BftError {
    #[error(
        "Header at height {height} declares max_height_previously_forged {declared} >= its own height"
    )]
    Contradiction { height: u64, declared: u64 },

    #[error(
        "Generator regressed max_height_previously_forged: declared {declared}, ledger has {recorded}"
    )]
    ForgedHeightRegression { declared: u64, recorded: u64 },
}

/// BFT configuration.
#[derive(Debug, Clone, Copy)]
pub struct BftConfig {
    /// Distance between a height and the block whose pre-vote confirmation
    /// finalizes it: height `h` is final once the pre-voted confirmed height
    /// observed at the block at `h + finality_offset` is at least `h`.
    pub finality_offset: u64,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self { finality_offset: 103 }
    }
}

/// Per-validator vote ledger entry, extracted from block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, sbor::prelude::BasicSbor)]
pub struct BftRecord {
    /// Height this validator asserts as prevoted.
    pub max_height_prevoted: u64,
    /// Largest height this validator had forged before its latest block.
    pub max_height_previously_forged: u64,
    /// Height of this validator's latest observed block; the value it must
    /// declare as previously-forged next time it forges.
    pub last_forged_height: u64,
}

impl BftRecord {
    pub fn encode(&self) -> Vec<u8> {
        sbor::basic_encode(self)
            .expect("BFT record encoding must succeed - this is a bug if it fails")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        sbor::basic_decode(bytes).ok()
    }
}

/// The outcome of observing one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BftUpdate {
    /// The generator's new ledger record, for the commit batch.
    pub record: BftRecord,
    /// Set when the finalized height advanced.
    pub finalized_advance: Option<u64>,
}

/// Tracks validator prevotes and derives the finalized height.
///
/// Finality is monotone non-decreasing. A regression can only come from a
/// bug, never from input, so the accessors enforce it with saturating
/// maximums rather than trying to recover.
#[derive(Debug)]
pub struct FinalityManager {
    config: BftConfig,
    ledger: HashMap<Address, BftRecord>,
    /// Pre-voted confirmed height as observed after each block height.
    /// Bounded: pruned below the finalized height.
    prevote_history: BTreeMap<u64, u64>,
    pre_voted_confirmed_height: u64,
    finalized_height: u64,
}

impl FinalityManager {
    pub fn new(config: BftConfig) -> Self {
        Self {
            config,
            ledger: HashMap::new(),
            prevote_history: BTreeMap::new(),
            pre_voted_confirmed_height: 0,
            finalized_height: 0,
        }
    }

    /// Restore from persisted records after a restart.
    ///
    /// The prevote history is reseeded from the restored ledger at the tip
    /// height; finalization resumes from there as new blocks arrive.
    pub fn restore(
        &mut self,
        entries: Vec<(Address, BftRecord)>,
        finalized_height: u64,
        tip_height: u64,
        active: &ValidatorSet,
    ) {
        self.ledger = entries.into_iter().collect();
        self.finalized_height = finalized_height;
        self.pre_voted_confirmed_height = self.derive_pre_voted_height(active);
        self.prevote_history.clear();
        self.prevote_history
            .insert(tip_height, self.pre_voted_confirmed_height);
        info!(
            finalized_height,
            pre_voted = self.pre_voted_confirmed_height,
            validators = self.ledger.len(),
            "Restored BFT state"
        );
    }

    pub fn finalized_height(&self) -> u64 {
        self.finalized_height
    }

    pub fn pre_voted_confirmed_height(&self) -> u64 {
        self.pre_voted_confirmed_height
    }

    /// The ledger record for a validator, if any.
    pub fn record_for(&self, validator: &Address) -> Option<&BftRecord> {
        self.ledger.get(validator)
    }

    /// The update rule's rejections, without mutating anything. Run in the
    /// processor's verify stage.
    pub fn verify_header(&self, header: &BlockHeader) -> Result<(), BftError> {
        if header.asset.max_height_previously_forged >= header.height {
            return Err(BftError::Contradiction {
                height: header.height,
                declared: header.asset.max_height_previously_forged,
            });
        }
        let generator = Address::from_public_key(&header.generator_public_key);
        if let Some(record) = self.ledger.get(&generator) {
            if header.asset.max_height_previously_forged < record.max_height_previously_forged {
                return Err(BftError::ForgedHeightRegression {
                    declared: header.asset.max_height_previously_forged,
                    recorded: record.max_height_previously_forged,
                });
            }
        }
        Ok(())
    }

    /// Record a header and re-derive finality.
    ///
    /// The caller must have run [`Self::verify_header`] first; this method
    /// assumes the header passed.
    pub fn observe_header(&mut self, header: &BlockHeader, active: &ValidatorSet) -> BftUpdate {
        let generator = Address::from_public_key(&header.generator_public_key);
        // Forging a block is itself a prevote for it: the generator asserts
        // it has seen and accepted everything up to and including its own
        // height, in addition to whatever it declared.
        let implied = header.asset.max_height_prevoted.max(header.height);
        let record = BftRecord {
            max_height_prevoted: implied.max(
                self.ledger
                    .get(&generator)
                    .map(|r| r.max_height_prevoted)
                    .unwrap_or(0),
            ),
            max_height_previously_forged: header.asset.max_height_previously_forged,
            last_forged_height: header.height,
        };
        self.ledger.insert(generator, record);

        let derived = self.derive_pre_voted_height(active);
        // The derivation can dip when the validator set rotates; the
        // confirmed height itself never moves backwards.
        self.pre_voted_confirmed_height = self.pre_voted_confirmed_height.max(derived);
        self.prevote_history
            .insert(header.height, self.pre_voted_confirmed_height);

        let finalized_advance = self.derive_finalized_height();
        if let Some(height) = finalized_advance {
            info!(height, "Finalized height advanced");
            self.finalized_height = height;
            self.prune_history();
        }

        debug!(
            height = header.height,
            generator = %generator,
            pre_voted = self.pre_voted_confirmed_height,
            finalized = self.finalized_height,
            "Observed header"
        );

        BftUpdate { record, finalized_advance }
    }

    /// Undo the in-memory effect of the reverted tip block.
    ///
    /// The persisted record was already restored from the undo journal; this
    /// realigns the in-memory ledger and history. The finalized height is
    /// left untouched: finality never regresses.
    pub fn on_block_reverted(&mut self, height: u64, generator: Address, prior: Option<BftRecord>) {
        match prior {
            Some(record) => {
                self.ledger.insert(generator, record);
            }
            None => {
                self.ledger.remove(&generator);
            }
        }
        self.prevote_history.remove(&height);
        if let Some((_, pvch)) = self.prevote_history.iter().next_back() {
            self.pre_voted_confirmed_height = *pvch;
        }
    }

    /// Largest height that more than two thirds of the active set asserts
    /// as prevoted.
    fn derive_pre_voted_height(&self, active: &ValidatorSet) -> u64 {
        if active.is_empty() {
            return 0;
        }
        let mut prevotes: Vec<u64> = active
            .members
            .iter()
            .map(|v| self.ledger.get(v).map(|r| r.max_height_prevoted).unwrap_or(0))
            .collect();
        prevotes.sort_unstable_by(|a, b| b.cmp(a));
        let needed = active.two_thirds_threshold();
        if prevotes.len() < needed {
            return 0;
        }
        // The needed-th largest prevote: every height up to it has a strict
        // supermajority asserting at least it.
        prevotes[needed - 1]
    }

    /// Largest `h` whose confirmation block (`h + finality_offset`) carries
    /// a pre-voted confirmed height of at least `h`. Returns `Some` only on
    /// an advance.
    fn derive_finalized_height(&self) -> Option<u64> {
        let offset = self.config.finality_offset;
        let mut best = self.finalized_height;
        for (&block_height, &pvch) in self.prevote_history.iter() {
            if block_height < offset {
                continue;
            }
            let candidate = block_height - offset;
            if pvch >= candidate && candidate > best {
                best = candidate;
            }
        }
        (best > self.finalized_height).then_some(best)
    }

    fn prune_history(&mut self) {
        let floor = self.finalized_height;
        self.prevote_history.retain(|&height, _| height >= floor);
    }
}
