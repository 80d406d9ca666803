//! The composed node state machine.

use crate::config::NodeConfig;
use forgeline_bft::{BftConfig, BftRecord, FinalityManager};
use forgeline_chain::{
    keys, BaseFee, Chain, ChainConfig, ChainError, DataAccess, FeePolicy, KvStore, ModuleRegistry,
    RewardSchedule, StateStore,
};
use forgeline_core::{
    Action, ChainEvent, Event, OutboundMessage, RemovalReason, StateMachine, TimerId,
};
use forgeline_forger::{Forger, ForgerConfig};
use forgeline_mempool::{self as mempool, PoolConfig, PoolError, TransactionPool};
use forgeline_messages::TransactionAnnouncement;
use forgeline_processor::{BlockProcessor, Origin, ProcessorConfig};
use forgeline_sync::{SyncConfig, Synchronizer};
use forgeline_types::{Account, Address, Block, Hash, PeerId, Slots, Transaction};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Peer penalty for gossiping an invalid transaction.
const PENALTY_INVALID_TRANSACTION: u32 = 100;

/// Errors from node construction.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// The node: processor, pool, forger and synchronizer behind one
/// [`StateMachine`].
pub struct NodeStateMachine {
    processor: BlockProcessor,
    pool: TransactionPool,
    forger: Forger,
    sync: Synchronizer,
    forge_interval: Duration,
    sweep_interval: Duration,
    now: Duration,
}

impl NodeStateMachine {
    /// Build the node over a store, bootstrapping or resuming the chain.
    ///
    /// Returns the machine plus the boot actions: timer arming and anything
    /// produced by replaying the temp region after an interrupted switch.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn KvStore>,
        genesis: &Block,
        genesis_accounts: &[Account],
    ) -> Result<(Self, Vec<Action>), NodeError> {
        config.validate()?;

        let chain_config = ChainConfig {
            round_length: config.genesis.round_length,
            max_temp_blocks: 500,
        };
        let (chain, init) = Chain::init(store, chain_config, genesis, genesis_accounts)?;
        if init.genesis_persisted {
            info!(id = %genesis.id(), "Bootstrapped fresh chain from genesis");
        }

        // Restore the BFT ledger from its persisted records.
        let mut bft = FinalityManager::new(BftConfig {
            finality_offset: config.genesis.bft_threshold,
        });
        let mut entries = Vec::new();
        for (key, value) in chain
            .store()
            .iter_prefix(keys::BFT_PREFIX)
            .map_err(ChainError::Storage)?
        {
            // `bft:finalized` shares the prefix; validator records carry a
            // 20-byte address suffix.
            let suffix = &key[keys::BFT_PREFIX.len()..];
            if suffix.len() != Address::LENGTH {
                continue;
            }
            let raw: [u8; 20] = suffix.try_into().expect("length checked above");
            if let Some(record) = BftRecord::decode(&value) {
                entries.push((Address::from_raw(raw), record));
            }
        }
        bft.restore(
            entries,
            chain.finalized_height(),
            chain.last_block().height(),
            chain.active_validators(),
        );

        let slots = Slots::new(
            config.genesis.timestamp,
            config.genesis.block_time,
            config.genesis.round_length,
        );
        let fee_policy = FeePolicy::new(
            config.genesis.min_fee_per_byte,
            config
                .genesis
                .base_fees
                .iter()
                .map(|f| BaseFee { module_id: f.module_id, asset_id: f.asset_id, amount: f.base_fee })
                .collect(),
        );
        let rewards = RewardSchedule::new(
            config.genesis.rewards.milestones.clone(),
            config.genesis.rewards.offset,
            config.genesis.rewards.distance,
        );
        let mut processor = BlockProcessor::new(
            chain,
            bft,
            ModuleRegistry::builtin(),
            fee_policy,
            rewards,
            slots,
            ProcessorConfig {
                block_version: 2,
                max_payload_length: config.genesis.max_payload_length,
            },
        );

        // Resume an interrupted chain switch before anything else runs.
        let mut boot_actions = processor.replay_temp_blocks(init.temp_blocks);

        let pool = TransactionPool::new(PoolConfig {
            max_transactions: config.pool.max_transactions,
            max_per_sender: config.pool.max_per_sender,
            replace_factor_percent: config.pool.replace_factor_percent,
            expiry_interval: Duration::from_secs(config.pool.expiry_interval_secs),
            min_entrance_fee_per_byte: config.pool.min_entrance_fee_per_byte,
        });

        let mut forger = Forger::new(
            ForgerConfig {
                block_version: 2,
                wait_threshold: config.forging.wait_threshold,
                force: config.forging.force,
                max_payload_length: config.genesis.max_payload_length,
                min_pending_transactions: config.forging.min_pending_transactions,
            },
            config.forging.delegates.clone(),
        );
        if let Some(password) = &config.forging.default_password {
            for delegate in &config.forging.delegates {
                if let Err(e) = forger.update_forging_status(delegate.address, password, true) {
                    warn!(address = %delegate.address, error = %e, "Default password did not unlock delegate");
                }
            }
        }

        let sync = Synchronizer::new(SyncConfig {
            min_tip_agreement: config.sync.min_tip_agreement,
            max_retries: config.sync.max_retries,
            round_length: config.genesis.round_length as u64,
        });

        let forge_interval = Duration::from_millis(config.forging.forge_interval_ms);
        let sweep_interval = Duration::from_secs(config.pool.sweep_interval_secs);
        boot_actions.push(Action::SetTimer { id: TimerId::Forge, duration: forge_interval });
        boot_actions.push(Action::SetTimer { id: TimerId::PoolSweep, duration: sweep_interval });

        Ok((
            Self {
                processor,
                pool,
                forger,
                sync,
                forge_interval,
                sweep_interval,
                now: Duration::ZERO,
            },
            boot_actions,
        ))
    }

    pub fn processor(&self) -> &BlockProcessor {
        &self.processor
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn forger(&self) -> &Forger {
        &self.forger
    }

    /// Whether a sync mechanism is running.
    pub fn is_syncing(&self) -> bool {
        self.sync.is_active()
    }

    /// Shared read view over persisted state, for the operator surface and
    /// for serving peer RPCs.
    pub fn data_access(&self) -> DataAccess {
        self.processor.chain().data_access()
    }

    /// Pooled transactions for the given ids, for serving `get_transactions`.
    pub fn pooled_transactions(&self, ids: &[Hash]) -> Vec<Transaction> {
        self.pool.get_many(ids)
    }

    /// Abort in-flight work for shutdown. In-flight block applies have
    /// already completed or undone by the time an event returns, so this
    /// only needs to stop the synchronizer.
    pub fn shutdown(&mut self) {
        self.sync.cancel();
    }

    fn on_forge_tick(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Forge,
            duration: self.forge_interval,
        }];
        let now = self.now.as_secs() as u32;
        if let Some(block) = self
            .forger
            .on_tick(&self.processor, &self.pool, self.sync.is_active(), now)
        {
            actions.push(Action::EnqueueInternal {
                event: Event::LocalBlockForged { block: Box::new(block) },
            });
        }
        actions
    }

    fn on_pool_sweep(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::PoolSweep,
            duration: self.sweep_interval,
        }];
        for removal in self.pool.sweep_expired(self.now) {
            actions.push(emit_removal(&removal));
        }
        actions
    }

    fn on_transaction_received(
        &mut self,
        transaction: Transaction,
        from: Option<PeerId>,
    ) -> Vec<Action> {
        let id = transaction.id();
        let data = self.processor.chain().data_access();
        let processor = &self.processor;
        let result = self.pool.admit(transaction, &data, self.now, |run| {
            let mut store = StateStore::new(processor.chain().store());
            processor
                .verify_transactions(run, &mut store)
                .map_err(|e| e.to_string())
        });

        match result {
            Ok(outcome) => {
                debug!(%id, "Transaction admitted");
                let mut actions: Vec<Action> =
                    outcome.removed.iter().map(emit_removal).collect();
                actions.push(Action::Broadcast {
                    message: OutboundMessage::TransactionAnnouncement(TransactionAnnouncement {
                        ids: vec![outcome.id],
                    }),
                });
                actions
            }
            Err(PoolError::Duplicate) => Vec::new(),
            Err(e @ PoolError::Invalid(_)) => {
                debug!(%id, error = %e, "Rejected invalid transaction");
                match from {
                    Some(peer) => vec![Action::PenalizePeer {
                        peer,
                        points: PENALTY_INVALID_TRANSACTION,
                    }],
                    None => Vec::new(),
                }
            }
            Err(e) => {
                debug!(%id, error = %e, "Rejected transaction");
                Vec::new()
            }
        }
    }

    fn on_block_applied(&mut self, block: &Block) -> Vec<Action> {
        let data = self.processor.chain().data_access();
        self.pool
            .on_block_applied(block, &data)
            .iter()
            .map(emit_removal)
            .collect()
    }

    fn on_block_reverted(&mut self, block: &Block) -> Vec<Action> {
        let data = self.processor.chain().data_access();
        let processor = &self.processor;
        let readmitted = self.pool.on_block_reverted(block, &data, self.now, |run| {
            let mut store = StateStore::new(processor.chain().store());
            processor
                .verify_transactions(run, &mut store)
                .map_err(|e| e.to_string())
        });
        debug!(height = block.height(), readmitted, "Re-admitted reverted payload");
        Vec::new()
    }
}

fn emit_removal(removal: &mempool::RemovedTransaction) -> Action {
    let reason = match removal.reason {
        mempool::RemovalReason::Included => RemovalReason::Included,
        mempool::RemovalReason::Expired => RemovalReason::Expired,
        mempool::RemovalReason::Evicted => RemovalReason::Evicted,
        mempool::RemovalReason::Replaced => RemovalReason::Replaced,
        mempool::RemovalReason::StaleNonce => RemovalReason::StaleNonce,
    };
    Action::Emit {
        event: ChainEvent::TransactionRemoved { id: removal.id, reason },
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::ForgeTick => self.on_forge_tick(),
            Event::PoolSweepTimer => self.on_pool_sweep(),

            Event::BlockReceived { block, from } => {
                if self.sync.is_active() {
                    // The transport already drops inbound blocks during
                    // sync; this is the second line of defence.
                    debug!(height = block.height(), "Dropping block: sync active");
                    return Vec::new();
                }
                self.processor.process(*block, Origin::Peer(from))
            }
            Event::LocalBlockForged { block } => self.processor.process(*block, Origin::Local),

            Event::TransactionReceived { transaction, from } => {
                self.on_transaction_received(*transaction, from)
            }
            Event::TransactionsAnnounced { ids, from } => {
                let unknown = self.pool.unknown_ids(&ids);
                if unknown.is_empty() {
                    Vec::new()
                } else {
                    vec![Action::RequestTransactions { from, ids: unknown }]
                }
            }

            Event::SyncRequired { block, peer } => {
                self.sync.on_sync_required(*block, peer, &mut self.processor)
            }
            Event::NetworkTipsReceived { tips } => {
                self.sync.on_network_tips(tips, &mut self.processor)
            }
            Event::HighestCommonBlockReceived { from, id } => {
                self.sync.on_highest_common_block(from, id, &mut self.processor)
            }
            Event::SyncBlocksReceived { from, blocks } => {
                self.sync.on_sync_blocks(from, blocks, &mut self.processor)
            }
            Event::PeerRequestFailed { from, reason } => {
                self.sync.on_request_failed(from, &reason, &mut self.processor)
            }

            Event::UpdateForgingStatus { address, password, enabled } => {
                match self.forger.update_forging_status(address, &password, enabled) {
                    Ok(state) => info!(address = %address, forging = state, "Forging status updated"),
                    Err(e) => warn!(address = %address, error = %e, "Forging status update failed"),
                }
                Vec::new()
            }

            Event::BlockApplied { block } => self.on_block_applied(&block),
            Event::BlockReverted { block } => self.on_block_reverted(&block),
            Event::FinalityAdvanced { height } => {
                debug!(height, "Finality advanced");
                Vec::new()
            }
            Event::RoundChanged { round } => {
                debug!(round, "Round changed");
                Vec::new()
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("height", &self.processor.chain().last_block().height())
            .field("finalized", &self.processor.chain().finalized_height())
            .field("pool", &self.pool.len())
            .field("syncing", &self.sync.is_active())
            .finish()
    }
}
