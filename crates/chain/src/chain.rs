//! The chain: block store, tip tracking, temp region and atomic commits.

use crate::data_access::DataAccess;
use crate::journal::JournalEntry;
use crate::keys;
use crate::state_store::StateDiff;
use crate::store::{KvStore, StorageError, WriteBatch};
use forgeline_types::{Account, Address, Block, Hash, ValidatorSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Stored genesis {stored} does not match supplied genesis {supplied}")]
    GenesisMismatch { stored: Hash, supplied: Hash },

    #[error("Missing expected record: {0}")]
    NotFound(String),

    #[error("Undo journal missing for block {block_id}; cannot revert")]
    JournalMissing { block_id: Hash },

    #[error("The genesis block cannot be reverted")]
    CannotRevertGenesis,
}

/// Chain configuration.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Slots per round; also the size of the active validator set.
    pub round_length: u32,
    /// Bound on the temp region.
    pub max_temp_blocks: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { round_length: 103, max_temp_blocks: 500 }
    }
}

/// What `Chain::init` found in the store.
#[derive(Debug)]
pub struct InitOutcome {
    /// Whether genesis was persisted by this call (fresh store).
    pub genesis_persisted: bool,
    /// Superseded blocks left in the temp region by an interrupted switch,
    /// ascending by height. The processor replays the ones that still extend
    /// the chain.
    pub temp_blocks: Vec<Block>,
}

/// The chain state machine's storage half.
///
/// Uniquely owns the persisted state: every mutation is an atomic batch
/// assembled here. The processor holds the only mutable reference during a
/// block apply; everything else reads through [`DataAccess`].
pub struct Chain {
    store: Arc<dyn KvStore>,
    config: ChainConfig,
    genesis_id: Hash,
    last_block: Block,
    finalized_height: u64,
    active_validators: ValidatorSet,
}

impl Chain {
    /// Open the chain, bootstrapping a fresh store from `genesis`.
    ///
    /// On a non-empty store the supplied genesis must match the stored one
    /// (`GenesisMismatch` otherwise), and the tip block is reloaded. Blocks
    /// left in the temp region are returned for replay.
    pub fn init(
        store: Arc<dyn KvStore>,
        config: ChainConfig,
        genesis: &Block,
        genesis_accounts: &[Account],
    ) -> Result<(Self, InitOutcome), ChainError> {
        let data = DataAccess::new(store.clone());
        let genesis_id = genesis.id();

        let (last_block, genesis_persisted) = match data.tip_id()? {
            None => {
                let mut batch = WriteBatch::new();
                batch.put(
                    keys::block_by_id(&genesis_id),
                    sbor::basic_encode(genesis)
                        .expect("block encoding must succeed - this is a bug if it fails"),
                );
                batch.put(keys::block_by_height(genesis.height()), genesis_id.as_bytes().to_vec());
                for account in genesis_accounts {
                    batch.put(
                        keys::account(&account.address),
                        sbor::basic_encode(account)
                            .expect("account encoding must succeed - this is a bug if it fails"),
                    );
                }
                batch.put(keys::BFT_FINALIZED, genesis.height().to_be_bytes().to_vec());
                batch.put(keys::CHAIN_TIP, genesis_id.as_bytes().to_vec());
                store.write(batch)?;
                info!(id = %genesis_id, "Persisted genesis block");
                (genesis.clone(), true)
            }
            Some(tip_id) => {
                let stored_genesis = data
                    .get_block_id_at_height(genesis.height())?
                    .ok_or_else(|| ChainError::NotFound("genesis block id".to_string()))?;
                if stored_genesis != genesis_id {
                    return Err(ChainError::GenesisMismatch {
                        stored: stored_genesis,
                        supplied: genesis_id,
                    });
                }
                let tip = data
                    .get_block_by_id(&tip_id)?
                    .ok_or_else(|| ChainError::NotFound(format!("tip block {tip_id}")))?;
                debug!(height = tip.height(), id = %tip_id, "Reloaded chain tip");
                (tip, false)
            }
        };

        let finalized_height = data.finalized_height()?;
        let mut chain = Self {
            store,
            config,
            genesis_id,
            last_block,
            finalized_height,
            active_validators: ValidatorSet::new(0, Vec::new()),
        };
        let round = if chain.last_block.height() == 0 {
            1
        } else {
            (chain.last_block.height() - 1) / chain.config.round_length as u64 + 1
        };
        chain.active_validators = chain.compute_validator_set(round)?;

        let temp_blocks = chain.temp_blocks()?;
        Ok((chain, InitOutcome { genesis_persisted, temp_blocks }))
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn genesis_id(&self) -> Hash {
        self.genesis_id
    }

    /// The current tip.
    pub fn last_block(&self) -> &Block {
        &self.last_block
    }

    /// The persisted finalized height.
    pub fn finalized_height(&self) -> u64 {
        self.finalized_height
    }

    /// Shared read-only view.
    pub fn data_access(&self) -> DataAccess {
        DataAccess::new(self.store.clone())
    }

    /// The backing store handle.
    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    /// The validator set active for the current round.
    pub fn active_validators(&self) -> &ValidatorSet {
        &self.active_validators
    }

    pub fn set_active_validators(&mut self, set: ValidatorSet) {
        self.active_validators = set;
    }

    /// Compute the validator set for `round` from current account state.
    ///
    /// Top `round_length` delegates by received votes, ties broken by
    /// address ascending, so every node derives the same ordering.
    pub fn compute_validator_set(&self, round: u64) -> Result<ValidatorSet, ChainError> {
        let mut delegates: Vec<(u64, Address)> = Vec::new();
        for (key, value) in self.store.iter_prefix(keys::ACCOUNT_PREFIX)? {
            let account: Account =
                sbor::basic_decode(&value).map_err(|e| StorageError::Corrupted {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    reason: format!("{e:?}"),
                })?;
            if let Some(info) = &account.delegate {
                delegates.push((info.total_votes_received, account.address));
            }
        }
        delegates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let members = delegates
            .into_iter()
            .take(self.config.round_length as usize)
            .map(|(_, address)| address)
            .collect();
        Ok(ValidatorSet::new(round, members))
    }

    /// Commit a block and every side effect of applying it in one batch.
    ///
    /// The batch covers block bytes, the height index, updated accounts and
    /// module state, BFT records, the finalized height, the undo-journal
    /// entry and the tip pointer. On success the cached tip advances; on
    /// failure nothing is visible.
    pub fn commit_block(
        &mut self,
        block: &Block,
        diff: StateDiff,
        bft_updates: Vec<(Address, Vec<u8>)>,
        prior_bft_records: Vec<(Address, Option<Vec<u8>>)>,
        new_finalized_height: Option<u64>,
    ) -> Result<(), ChainError> {
        let block_id = block.id();
        let journal = JournalEntry {
            block_id,
            prior_accounts: diff.prior_accounts,
            prior_chain_state: diff.prior_chain_state,
            prior_bft_records,
            prior_finalized_height: self.finalized_height,
        };

        let mut batch = WriteBatch::new();
        batch.put(
            keys::block_by_id(&block_id),
            sbor::basic_encode(block)
                .expect("block encoding must succeed - this is a bug if it fails"),
        );
        batch.put(keys::block_by_height(block.height()), block_id.as_bytes().to_vec());
        for account in &diff.updated_accounts {
            batch.put(
                keys::account(&account.address),
                sbor::basic_encode(account)
                    .expect("account encoding must succeed - this is a bug if it fails"),
            );
        }
        for (key, value) in &diff.updated_chain_state {
            batch.put(keys::chain_state(key), value.clone());
        }
        for (validator, record) in &bft_updates {
            batch.put(keys::bft_record(validator), record.clone());
        }
        if let Some(height) = new_finalized_height {
            batch.put(keys::BFT_FINALIZED, height.to_be_bytes().to_vec());
        }
        batch.put(keys::journal(&block_id), journal.encode());
        batch.put(keys::CHAIN_TIP, block_id.as_bytes().to_vec());
        self.store.write(batch)?;

        self.last_block = block.clone();
        if let Some(height) = new_finalized_height {
            let previous = self.finalized_height;
            self.finalized_height = height;
            self.prune_finalized(previous, height)?;
        }
        Ok(())
    }

    /// Drop journals and temp blocks at or below the new finalized height.
    /// Finalized blocks are never reverted, so their undo records are dead.
    fn prune_finalized(&self, previous: u64, finalized: u64) -> Result<(), ChainError> {
        let data = self.data_access();
        let mut batch = WriteBatch::new();
        for height in (previous + 1)..=finalized {
            if let Some(id) = data.get_block_id_at_height(height)? {
                batch.delete(keys::journal(&id));
            }
        }
        for block in self.temp_blocks()? {
            if block.height() <= finalized {
                batch.delete(keys::temp_block(&block.id()));
            }
        }
        if !batch.is_empty() {
            self.store.write(batch)?;
        }
        Ok(())
    }

    /// Revert the tip, restoring every touched key from the undo journal.
    ///
    /// With `move_to_temp` the reverted block lands in the temp region so a
    /// chain switch can be resumed after a crash. The finalized height is
    /// never regressed, even though the journal records the prior value:
    /// finality is monotone by contract.
    pub fn revert_last_block(&mut self, move_to_temp: bool) -> Result<Block, ChainError> {
        let reverted = self.last_block.clone();
        let block_id = reverted.id();
        if reverted.height() == 0 {
            return Err(ChainError::CannotRevertGenesis);
        }

        let journal_bytes = self
            .store
            .get(&keys::journal(&block_id))?
            .ok_or(ChainError::JournalMissing { block_id })?;
        let journal =
            JournalEntry::decode(&journal_bytes).ok_or(ChainError::JournalMissing { block_id })?;

        let data = self.data_access();
        let parent = data
            .get_block_by_id(&reverted.header.previous_block_id)?
            .ok_or_else(|| {
                ChainError::NotFound(format!("parent of {} at height {}", block_id, reverted.height()))
            })?;

        let mut batch = WriteBatch::new();
        batch.delete(keys::block_by_id(&block_id));
        batch.delete(keys::block_by_height(reverted.height()));
        for (address, prior) in &journal.prior_accounts {
            match prior {
                Some(bytes) => batch.put(keys::account(address), bytes.clone()),
                None => batch.delete(keys::account(address)),
            }
        }
        for (key, prior) in &journal.prior_chain_state {
            match prior {
                Some(bytes) => batch.put(keys::chain_state(key), bytes.clone()),
                None => batch.delete(keys::chain_state(key)),
            }
        }
        for (validator, prior) in &journal.prior_bft_records {
            match prior {
                Some(bytes) => batch.put(keys::bft_record(validator), bytes.clone()),
                None => batch.delete(keys::bft_record(validator)),
            }
        }
        batch.delete(keys::journal(&block_id));
        if move_to_temp {
            batch.put(
                keys::temp_block(&block_id),
                sbor::basic_encode(&reverted)
                    .expect("block encoding must succeed - this is a bug if it fails"),
            );
        }
        batch.put(keys::CHAIN_TIP, parent.id().as_bytes().to_vec());
        self.store.write(batch)?;

        if move_to_temp {
            self.enforce_temp_bound()?;
        }

        debug!(height = reverted.height(), id = %block_id, "Reverted tip block");
        self.last_block = parent;
        Ok(reverted)
    }

    /// Blocks currently parked in the temp region, ascending by height.
    pub fn temp_blocks(&self) -> Result<Vec<Block>, ChainError> {
        let mut blocks = Vec::new();
        for (key, value) in self.store.iter_prefix(keys::TEMP_PREFIX)? {
            let block: Block = sbor::basic_decode(&value).map_err(|e| StorageError::Corrupted {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: format!("{e:?}"),
            })?;
            blocks.push(block);
        }
        blocks.sort_by_key(|b| b.height());
        Ok(blocks)
    }

    /// Remove one block from the temp region.
    pub fn delete_temp_block(&self, id: &Hash) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.delete(keys::temp_block(id));
        self.store.write(batch)
    }

    /// Clear the whole temp region.
    pub fn clear_temp(&self) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.iter_prefix(keys::TEMP_PREFIX)? {
            batch.delete(key);
        }
        if !batch.is_empty() {
            self.store.write(batch)?;
        }
        Ok(())
    }

    fn enforce_temp_bound(&self) -> Result<(), ChainError> {
        let blocks = self.temp_blocks()?;
        if blocks.len() <= self.config.max_temp_blocks {
            return Ok(());
        }
        let excess = blocks.len() - self.config.max_temp_blocks;
        let mut batch = WriteBatch::new();
        for block in blocks.iter().take(excess) {
            warn!(height = block.height(), "Evicting oldest temp-region block");
            batch.delete(keys::temp_block(&block.id()));
        }
        self.store.write(batch)?;
        Ok(())
    }

    /// Ids used to probe a peer for the highest common block: the last two
    /// rounds of tip ids consecutively, then round boundaries down to the
    /// finalized height.
    pub fn common_block_probe_ids(&self) -> Result<Vec<Hash>, ChainError> {
        let data = self.data_access();
        let tip = self.last_block.height();
        let round_length = self.config.round_length as u64;
        let mut ids = Vec::new();

        let dense_floor = tip.saturating_sub(2 * round_length).max(self.finalized_height);
        let mut height = tip;
        loop {
            if let Some(id) = data.get_block_id_at_height(height)? {
                ids.push(id);
            }
            if height == 0 || height == self.finalized_height {
                break;
            }
            height = if height > dense_floor {
                height - 1
            } else if height > round_length {
                (height - 1) / round_length * round_length
            } else {
                0
            };
        }
        Ok(ids)
    }

    /// The highest consumed hash-onion index for a delegate.
    pub fn used_onion_index(&self, address: &Address) -> Result<Option<u32>, StorageError> {
        self.data_access().used_onion_index(address)
    }

    /// Persist a consumed hash-onion index. Written before the block is
    /// signed, so a crash can never reuse a layer.
    pub fn record_onion_usage(&self, address: &Address, index: u32) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(keys::forger_used_hashes(address), index.to_be_bytes().to_vec());
        self.store.write(batch)
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("height", &self.last_block.height())
            .field("tip", &self.last_block.id())
            .field("finalized_height", &self.finalized_height)
            .field("validators", &self.active_validators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::StateStore;
    use crate::store::MemoryStore;
    use forgeline_types::test_utils::{test_address, test_keypair};
    use forgeline_types::{merkle_root, BlockAsset, BlockHeader, DelegateInfo, Signature};

    fn genesis_block() -> Block {
        let kp = test_keypair(0);
        let mut header = BlockHeader {
            version: 2,
            height: 0,
            timestamp: 0,
            previous_block_id: Hash::ZERO,
            generator_public_key: kp.public_key(),
            transaction_root: merkle_root(&[]),
            asset: BlockAsset::genesis(),
            signature: Signature::zero(),
        };
        header.sign(&kp);
        Block { header, payload: Vec::new() }
    }

    fn child_of(parent: &Block, seed: u8) -> Block {
        let kp = test_keypair(seed);
        let mut header = BlockHeader {
            version: 2,
            height: parent.height() + 1,
            timestamp: (parent.height() as u32 + 1) * 10,
            previous_block_id: parent.id(),
            generator_public_key: kp.public_key(),
            transaction_root: merkle_root(&[]),
            asset: BlockAsset {
                max_height_previously_forged: parent.height(),
                max_height_prevoted: 0,
                seed_reveal: [seed; 16],
            },
            signature: Signature::zero(),
        };
        header.sign(&kp);
        Block { header, payload: Vec::new() }
    }

    fn delegate_account(seed: u8, votes: u64) -> Account {
        let mut account = Account::new(test_address(seed));
        account.delegate = Some(DelegateInfo {
            username: format!("delegate_{seed}"),
            total_votes_received: votes,
        });
        account
    }

    fn small_config() -> ChainConfig {
        ChainConfig { round_length: 3, max_temp_blocks: 5 }
    }

    #[test]
    fn init_persists_genesis_once() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let (chain, outcome) =
            Chain::init(store.clone(), small_config(), &genesis, &[]).unwrap();
        assert!(outcome.genesis_persisted);
        assert_eq!(chain.last_block().id(), genesis.id());

        drop(chain);
        let (chain, outcome) = Chain::init(store, small_config(), &genesis, &[]).unwrap();
        assert!(!outcome.genesis_persisted);
        assert_eq!(chain.last_block().id(), genesis.id());
    }

    #[test]
    fn init_rejects_wrong_genesis() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let (chain, _) = Chain::init(store.clone(), small_config(), &genesis, &[]).unwrap();
        drop(chain);

        let mut other = genesis_block();
        other.header.timestamp = 999;
        let err = Chain::init(store, small_config(), &other, &[]).unwrap_err();
        assert!(matches!(err, ChainError::GenesisMismatch { .. }));
    }

    fn commit_empty(chain: &mut Chain, block: &Block) {
        let diff = StateStore::new(chain.store()).into_diff();
        chain
            .commit_block(block, diff, Vec::new(), Vec::new(), None)
            .unwrap();
    }

    #[test]
    fn commit_and_revert_restore_state() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let mut funded = Account::new(test_address(9));
        funded.balance = 1_000;
        let (mut chain, _) =
            Chain::init(store.clone(), small_config(), &genesis, &[funded]).unwrap();

        let block = child_of(&genesis, 1);
        let mut snapshot = StateStore::new(chain.store());
        let mut account = snapshot.get_account(&test_address(9)).unwrap();
        account.balance = 250;
        snapshot.put_account(account);
        let mut fresh = snapshot.get_account(&test_address(10)).unwrap();
        fresh.balance = 750;
        snapshot.put_account(fresh);
        chain
            .commit_block(&block, snapshot.into_diff(), Vec::new(), Vec::new(), None)
            .unwrap();

        assert_eq!(chain.last_block().id(), block.id());
        let data = chain.data_access();
        assert_eq!(data.get_account(&test_address(9)).unwrap().unwrap().balance, 250);
        assert_eq!(data.get_account(&test_address(10)).unwrap().unwrap().balance, 750);

        let reverted = chain.revert_last_block(false).unwrap();
        assert_eq!(reverted.id(), block.id());
        assert_eq!(chain.last_block().id(), genesis.id());
        assert_eq!(data.get_account(&test_address(9)).unwrap().unwrap().balance, 1_000);
        // The account created by the reverted block is gone entirely.
        assert!(data.get_account(&test_address(10)).unwrap().is_none());
        assert!(data.get_block_by_height(1).unwrap().is_none());
    }

    #[test]
    fn revert_to_temp_parks_the_block() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let (mut chain, _) = Chain::init(store, small_config(), &genesis, &[]).unwrap();

        let block = child_of(&genesis, 1);
        commit_empty(&mut chain, &block);
        chain.revert_last_block(true).unwrap();

        let temp = chain.temp_blocks().unwrap();
        assert_eq!(temp.len(), 1);
        assert_eq!(temp[0].id(), block.id());

        chain.delete_temp_block(&block.id()).unwrap();
        assert!(chain.temp_blocks().unwrap().is_empty());
    }

    #[test]
    fn genesis_cannot_be_reverted() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let (mut chain, _) = Chain::init(store, small_config(), &genesis, &[]).unwrap();
        assert!(matches!(
            chain.revert_last_block(false),
            Err(ChainError::CannotRevertGenesis)
        ));
    }

    #[test]
    fn finalization_prunes_journals() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let (mut chain, _) = Chain::init(store.clone(), small_config(), &genesis, &[]).unwrap();

        let b1 = child_of(&genesis, 1);
        commit_empty(&mut chain, &b1);
        let b2 = child_of(&b1, 2);
        let diff = StateStore::new(chain.store()).into_diff();
        chain
            .commit_block(&b2, diff, Vec::new(), Vec::new(), Some(1))
            .unwrap();

        assert_eq!(chain.finalized_height(), 1);
        // b1's journal is pruned; b2's remains.
        assert!(store.get(&keys::journal(&b1.id())).unwrap().is_none());
        assert!(store.get(&keys::journal(&b2.id())).unwrap().is_some());
    }

    #[test]
    fn validator_set_orders_by_votes_then_address() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let accounts = vec![
            delegate_account(1, 500),
            delegate_account(2, 900),
            delegate_account(3, 500),
            delegate_account(4, 100),
        ];
        let (chain, _) = Chain::init(store, small_config(), &genesis, &accounts).unwrap();

        let set = chain.compute_validator_set(1).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.members[0], test_address(2));
        // 500-vote tie broken by ascending address.
        let tied: Vec<Address> = set.members[1..].to_vec();
        let mut expected = vec![test_address(1), test_address(3)];
        expected.sort();
        assert_eq!(tied, expected);
    }

    #[test]
    fn probe_ids_start_at_tip() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let (mut chain, _) = Chain::init(store, small_config(), &genesis, &[]).unwrap();
        let mut parent = genesis;
        for seed in 1..=5u8 {
            let block = child_of(&parent, seed);
            commit_empty(&mut chain, &block);
            parent = block;
        }
        let ids = chain.common_block_probe_ids().unwrap();
        assert_eq!(ids.first(), Some(&chain.last_block().id()));
        assert!(ids.len() >= 5);
    }

    #[test]
    fn onion_usage_round_trip() {
        let store = MemoryStore::shared();
        let genesis = genesis_block();
        let (chain, _) = Chain::init(store, small_config(), &genesis, &[]).unwrap();

        assert_eq!(chain.used_onion_index(&test_address(1)).unwrap(), None);
        chain.record_onion_usage(&test_address(1), 7).unwrap();
        assert_eq!(chain.used_onion_index(&test_address(1)).unwrap(), Some(7));
    }
}
