//! The block processing pipeline.

use crate::fork_choice::{self, ForkDecision};
use forgeline_bft::{BftError, FinalityManager};
use forgeline_chain::{
    keys, ApplyContext, BlockContext, Chain, ChainError, FeePolicy, ModuleError, ModuleRegistry,
    RewardSchedule, StateStore,
};
use forgeline_core::{Action, ChainEvent, Event, OutboundMessage};
use forgeline_messages::BlockBroadcast;
use forgeline_types::{Address, Block, PeerId, Slots, Transaction};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Peer penalty for an invalid block or an irreparable fork attempt.
const PENALTY_INVALID: u32 = 100;
/// Peer penalty for a stale or duplicate block.
const PENALTY_STALE: u32 = 10;

/// Where a block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Forged by a local delegate.
    Local,
    /// Received from the network.
    Peer(PeerId),
}

/// Static (state-independent) block rejections.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unexpected header version {0}")]
    BadVersion(u32),

    #[error("Generator signature does not verify")]
    BadSignature,

    #[error("Block timestamp {timestamp} is outside the generator's slot")]
    WrongSlot { timestamp: u32 },

    #[error("Generator is not the delegate assigned to slot {slot}")]
    WrongForger { slot: u64 },

    #[error("Payload size {size} exceeds the limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Transaction root does not match the payload")]
    TransactionRootMismatch,

    #[error("Header does not link to the current tip")]
    BrokenLinkage,

    #[error(transparent)]
    Transaction(#[from] forgeline_types::TransactionError),

    #[error("No module handles ({module_id}, {asset_id})")]
    UnknownModule { module_id: u32, asset_id: u32 },
}

/// State-dependent block rejections.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Nonce mismatch for {sender}: transaction {nonce}, account {account_nonce}")]
    NonceMismatch {
        sender: Address,
        nonce: u64,
        account_nonce: u64,
    },

    #[error("Fee {fee} below the minimum {min_fee}")]
    FeeTooLow { fee: u64, min_fee: u64 },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Bft(#[from] BftError),
}

/// Errors from the processing pipeline.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Processor is busy; concurrent block processing is a bug")]
    Busy,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Expected header version.
    pub block_version: u32,
    /// Payload byte cap per block.
    pub max_payload_length: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { block_version: 2, max_payload_length: 15 * 1024 }
    }
}

/// Pipeline stage, the processor-wide state machine.
///
/// The event loop already serializes entry; the guard exists to turn an
/// accidental re-entry into a loud defect instead of silent corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Validating,
    Verifying,
    Applying,
}

/// The block processor.
///
/// Exactly one block apply is in flight at any time; this single-writer
/// property is the cornerstone of chain consistency.
pub struct BlockProcessor {
    chain: Chain,
    bft: FinalityManager,
    registry: ModuleRegistry,
    fee_policy: FeePolicy,
    rewards: RewardSchedule,
    slots: Slots,
    config: ProcessorConfig,
    stage: Stage,
}

impl BlockProcessor {
    pub fn new(
        chain: Chain,
        bft: FinalityManager,
        registry: ModuleRegistry,
        fee_policy: FeePolicy,
        rewards: RewardSchedule,
        slots: Slots,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            chain,
            bft,
            registry,
            fee_policy,
            rewards,
            slots,
            config,
            stage: Stage::Idle,
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn bft(&self) -> &FinalityManager {
        &self.bft
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        &self.fee_policy
    }

    /// What a local delegate must declare when forging: its last forged
    /// height and the node's current pre-voted confirmed height.
    pub fn forging_info(&self, delegate: &Address) -> (u64, u64) {
        let previously_forged = self
            .bft
            .record_for(delegate)
            .map(|r| r.last_forged_height)
            .unwrap_or(0);
        (previously_forged, self.bft.pre_voted_confirmed_height())
    }

    /// Replay blocks left in the temp region by an interrupted chain
    /// switch, then clear the region. Called once at boot.
    pub fn replay_temp_blocks(&mut self, temp_blocks: Vec<Block>) -> Vec<Action> {
        let mut actions = Vec::new();
        for block in temp_blocks {
            if block.header.previous_block_id != self.chain.last_block().id() {
                continue;
            }
            match self.process_validated(block) {
                Ok(mut block_actions) => actions.append(&mut block_actions),
                Err(e) => {
                    warn!(error = %e, "Dropped temp-region block during replay");
                    break;
                }
            }
        }
        if let Err(e) = self.chain.clear_temp() {
            warn!(error = %e, "Failed to clear temp region after replay");
        }
        actions
    }

    /// Full pipeline for a new block: fork choice, validate, verify, apply.
    ///
    /// Never escalates: every failure is translated into drop-plus-penalty
    /// actions, matching the component boundary contract.
    #[instrument(skip(self, block), fields(height = block.height(), origin = ?origin))]
    pub fn process(&mut self, block: Block, origin: Origin) -> Vec<Action> {
        let last = self.chain.last_block().clone();
        let last_id = last.id();
        let decision = fork_choice::choose(
            &block.header,
            &last.header,
            &last_id,
            self.chain.finalized_height(),
        );
        debug!(?decision, "Fork choice");

        match decision {
            ForkDecision::Append => match self.validate_then_apply(block, origin) {
                Ok(actions) => actions,
                Err(e) => self.reject(e, origin),
            },
            ForkDecision::Replace => match self.replace_tip(block, origin) {
                Ok(actions) => actions,
                Err(e) => self.reject(e, origin),
            },
            ForkDecision::SyncFastChainSwitch | ForkDecision::SyncBlockSync => match origin {
                Origin::Peer(peer) => {
                    info!(peer = %peer, ?decision, "Divergence detected; requesting sync");
                    vec![Action::EnqueueInternal {
                        event: Event::SyncRequired { block: Box::new(block), peer },
                    }]
                }
                Origin::Local => {
                    error!("Locally forged block diverged from own tip; dropping");
                    Vec::new()
                }
            },
            ForkDecision::DiscardIrrecoverable => {
                warn!(height = block.height(), "Irreparable fork attempt below finalized height");
                match origin {
                    Origin::Peer(peer) => {
                        vec![Action::PenalizePeer { peer, points: PENALTY_INVALID }]
                    }
                    Origin::Local => Vec::new(),
                }
            }
            ForkDecision::Discard => {
                debug!(height = block.height(), "Discarding stale or duplicate block");
                match origin {
                    Origin::Peer(peer) => {
                        vec![Action::PenalizePeer { peer, points: PENALTY_STALE }]
                    }
                    Origin::Local => Vec::new(),
                }
            }
        }
    }

    /// Pipeline without re-validation, for blocks the synchronizer already
    /// validated as a batch.
    pub fn process_validated(&mut self, block: Block) -> Result<Vec<Action>, ProcessError> {
        self.enter(Stage::Verifying)?;
        let result = self.verify_and_apply(block, None);
        self.stage = Stage::Idle;
        result
    }

    /// Revert the tip, restore accounts from the undo journal, and hand the
    /// payload back to the caller for pool re-admission.
    pub fn delete_last_block(&mut self, move_to_temp: bool) -> Result<Vec<Action>, ProcessError> {
        self.enter(Stage::Applying)?;
        let result = self.delete_last_block_inner(move_to_temp);
        self.stage = Stage::Idle;
        result
    }

    fn delete_last_block_inner(
        &mut self,
        move_to_temp: bool,
    ) -> Result<Vec<Action>, ProcessError> {
        let reverted = match self.chain.revert_last_block(move_to_temp) {
            Ok(block) => block,
            Err(e @ ChainError::JournalMissing { .. }) => {
                // An inconsistent journal cannot be recovered from here.
                error!(error = %e, "Undo journal inconsistent");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        // Realign the in-memory BFT ledger with the restored record.
        let generator = Address::from_public_key(&reverted.header.generator_public_key);
        let prior = self
            .chain
            .store()
            .get(&keys::bft_record(&generator))
            .ok()
            .flatten()
            .and_then(|bytes| forgeline_bft::BftRecord::decode(&bytes));
        self.bft
            .on_block_reverted(reverted.height(), generator, prior);

        info!(height = reverted.height(), id = %reverted.id(), "Deleted last block");
        Ok(vec![
            Action::EnqueueInternal { event: Event::BlockReverted { block: Box::new(reverted.clone()) } },
            Action::Emit { event: ChainEvent::DeleteBlock { block: Box::new(reverted) } },
        ])
    }

    /// Verify a batch of transactions against a fresh snapshot without
    /// touching persisted state. This is the callback handed to the pool.
    pub fn verify_transactions(
        &self,
        transactions: &[Transaction],
        store: &mut StateStore,
    ) -> Result<(), VerificationError> {
        for tx in transactions {
            self.apply_transaction(store, tx)?;
        }
        Ok(())
    }

    fn enter(&mut self, stage: Stage) -> Result<(), ProcessError> {
        if self.stage != Stage::Idle {
            error!(stage = ?self.stage, "Re-entered the processor; single-writer invariant broken");
            return Err(ProcessError::Busy);
        }
        self.stage = stage;
        Ok(())
    }

    fn reject(&mut self, error: ProcessError, origin: Origin) -> Vec<Action> {
        warn!(error = %error, ?origin, "Dropped block");
        match origin {
            Origin::Peer(peer) => vec![Action::PenalizePeer { peer, points: PENALTY_INVALID }],
            Origin::Local => Vec::new(),
        }
    }

    fn validate_then_apply(
        &mut self,
        block: Block,
        origin: Origin,
    ) -> Result<Vec<Action>, ProcessError> {
        self.enter(Stage::Validating)?;
        let result = (|| {
            self.validate(&block)?;
            self.stage = Stage::Verifying;
            self.verify_and_apply(block, Some(origin))
        })();
        self.stage = Stage::Idle;
        result
    }

    /// Discard-and-replace: park the tip in the temp region, then apply the
    /// same-height winner. If the winner fails, the parked block is
    /// restored so the chain never loses its tip.
    fn replace_tip(&mut self, block: Block, origin: Origin) -> Result<Vec<Action>, ProcessError> {
        self.enter(Stage::Validating)?;
        let result = (|| {
            self.validate(&block)?;
            self.stage = Stage::Applying;
            let mut actions = self.delete_last_block_inner(true)?;
            let parked = self.chain.temp_blocks()?;
            self.stage = Stage::Verifying;
            match self.verify_and_apply(block, Some(origin)) {
                Ok(mut apply_actions) => {
                    actions.append(&mut apply_actions);
                    Ok(actions)
                }
                Err(e) => {
                    warn!(error = %e, "Replacement block failed; restoring previous tip");
                    for parked_block in parked {
                        if parked_block.header.previous_block_id == self.chain.last_block().id() {
                            let parked_id = parked_block.id();
                            self.stage = Stage::Verifying;
                            let mut restore_actions = self.verify_and_apply(parked_block, None)?;
                            actions.append(&mut restore_actions);
                            self.chain.delete_temp_block(&parked_id).map_err(ChainError::Storage)?;
                        }
                    }
                    Err(e)
                }
            }
        })();
        self.stage = Stage::Idle;
        result
    }

    /// Validate stage: pure checks, no state reads beyond the validator
    /// schedule.
    fn validate(&self, block: &Block) -> Result<(), ValidationError> {
        let header = &block.header;
        if header.version != self.config.block_version {
            return Err(ValidationError::BadVersion(header.version));
        }
        if !header.verify_signature() {
            return Err(ValidationError::BadSignature);
        }

        let slot = self.slots.slot_number(header.timestamp);
        if !self.slots.is_within_slot(slot, header.timestamp) {
            return Err(ValidationError::WrongSlot { timestamp: header.timestamp });
        }
        let generator = Address::from_public_key(&header.generator_public_key);
        match self.chain.active_validators().generator_at(slot) {
            Some(assigned) if assigned == generator => {}
            _ => return Err(ValidationError::WrongForger { slot }),
        }

        let size = block.payload_size();
        if size > self.config.max_payload_length {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_length,
            });
        }
        if block.compute_transaction_root() != header.transaction_root {
            return Err(ValidationError::TransactionRootMismatch);
        }
        for tx in &block.payload {
            tx.static_validate()?;
            if !self.registry.supports(tx.module_id, tx.asset_id) {
                return Err(ValidationError::UnknownModule {
                    module_id: tx.module_id,
                    asset_id: tx.asset_id,
                });
            }
        }
        Ok(())
    }

    /// Verify and apply stages: every state-dependent check, then the
    /// atomic commit.
    fn verify_and_apply(
        &mut self,
        block: Block,
        origin: Option<Origin>,
    ) -> Result<Vec<Action>, ProcessError> {
        let last = self.chain.last_block();
        if block.header.previous_block_id != last.id() || block.height() != last.height() + 1 {
            return Err(ValidationError::BrokenLinkage.into());
        }

        self.bft
            .verify_header(&block.header)
            .map_err(VerificationError::Bft)?;

        let mut store = StateStore::new(self.chain.store());
        for tx in &block.payload {
            self.apply_transaction(&mut store, tx)?;
        }

        // Generator collects the block reward plus the payload fees.
        let generator = Address::from_public_key(&block.header.generator_public_key);
        let fees: u64 = block.payload.iter().map(|tx| tx.fee).sum();
        let reward = self.rewards.reward_at(block.height());
        let mut generator_account = store
            .get_account(&generator)
            .map_err(|e| VerificationError::Module(ModuleError::Storage(e)))?;
        generator_account.balance = generator_account
            .balance
            .saturating_add(reward)
            .saturating_add(fees);
        store.put_account(generator_account);

        self.stage = Stage::Applying;
        for module in self.registry.modules() {
            let mut ctx = BlockContext { store: &mut store, header: &block.header };
            module
                .after_block_apply(&mut ctx)
                .map_err(VerificationError::Module)?;
        }

        // Capture the prior BFT record for the undo journal before the
        // manager mutates it.
        let prior_bft = self
            .chain
            .store()
            .get(&keys::bft_record(&generator))
            .map_err(ChainError::Storage)?;
        let update = self.bft.observe_header(&block.header, self.chain.active_validators());

        self.chain.commit_block(
            &block,
            store.into_diff(),
            vec![(generator, update.record.encode())],
            vec![(generator, prior_bft)],
            update.finalized_advance,
        )?;

        let mut actions = vec![
            Action::EnqueueInternal { event: Event::BlockApplied { block: Box::new(block.clone()) } },
            Action::Emit { event: ChainEvent::NewBlock { block: Box::new(block.clone()) } },
        ];
        if let Some(height) = update.finalized_advance {
            actions.push(Action::EnqueueInternal { event: Event::FinalityAdvanced { height } });
            actions.push(Action::Emit { event: ChainEvent::BlockFinalized { height } });
        }

        // Rotate the validator set at the round boundary.
        let round = self.slots.round_of_height(block.height());
        if block.height() == self.slots.last_height_of_round(round) {
            let next = self.chain.compute_validator_set(round + 1)?;
            let changed = next.members != self.chain.active_validators().members;
            self.chain.set_active_validators(next);
            if changed {
                info!(round = round + 1, "Active validator set rotated");
                actions.push(Action::EnqueueInternal {
                    event: Event::RoundChanged { round: round + 1 },
                });
                actions.push(Action::Emit {
                    event: ChainEvent::ValidatorsChanged { round: round + 1 },
                });
            }
        }

        if origin == Some(Origin::Local) {
            actions.push(Action::Broadcast {
                message: OutboundMessage::Block(Box::new(BlockBroadcast { block })),
            });
        }
        Ok(actions)
    }

    /// Verify and apply a single transaction against the snapshot: nonce,
    /// minimum fee, module preconditions, then the state mutation.
    fn apply_transaction(
        &self,
        store: &mut StateStore,
        tx: &Transaction,
    ) -> Result<(), VerificationError> {
        let sender = tx.sender_address();
        let mut account = store
            .get_account(&sender)
            .map_err(|e| VerificationError::Module(ModuleError::Storage(e)))?;

        if tx.nonce != account.nonce {
            return Err(VerificationError::NonceMismatch {
                sender,
                nonce: tx.nonce,
                account_nonce: account.nonce,
            });
        }
        let min_fee = self.fee_policy.min_fee(tx);
        if tx.fee < min_fee {
            return Err(VerificationError::FeeTooLow { fee: tx.fee, min_fee });
        }

        let module = self
            .registry
            .get(tx.module_id, tx.asset_id)
            .ok_or(VerificationError::Module(ModuleError::UnknownAsset {
                module_id: tx.module_id,
                asset_id: tx.asset_id,
            }))?;

        let mut ctx = ApplyContext {
            store,
            sender,
            transaction: tx,
            block_height: self.chain.last_block().height() + 1,
        };
        module.verify(&mut ctx)?;

        // Consume the nonce and the fee before the asset semantics run.
        account.nonce += 1;
        account.balance = account.balance.saturating_sub(tx.fee);
        if account.public_key.is_none() {
            account.public_key = Some(tx.sender_public_key);
        }
        ctx.store.put_account(account);

        module.apply(&mut ctx)?;
        Ok(())
    }
}

impl std::fmt::Debug for BlockProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockProcessor")
            .field("height", &self.chain.last_block().height())
            .field("finalized", &self.chain.finalized_height())
            .field("stage", &self.stage)
            .finish()
    }
}
