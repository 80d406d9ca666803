//! Pool state.

use forgeline_chain::DataAccess;
use forgeline_types::{Address, Block, Hash, Transaction, TransactionError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global bound on pooled transactions.
    pub max_transactions: usize,
    /// Per-sender bound on pending nonces.
    pub max_per_sender: usize,
    /// Replacement premium in percent: a same-nonce replacement must pay at
    /// least `old.fee * replace_factor_percent / 100`.
    pub replace_factor_percent: u64,
    /// Transactions older than this are evicted on the periodic sweep.
    pub expiry_interval: Duration,
    /// Entrance floor on fee per byte; zero disables.
    pub min_entrance_fee_per_byte: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: 4096,
            max_per_sender: 64,
            replace_factor_percent: 110,
            expiry_interval: Duration::from_secs(3 * 60 * 60),
            min_entrance_fee_per_byte: 0,
        }
    }
}

/// Errors from pool admission.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Transaction already pooled")]
    Duplicate,

    #[error(transparent)]
    Invalid(#[from] TransactionError),

    #[error("Nonce {nonce} is below the account nonce {account_nonce}")]
    NonceTooLow { nonce: u64, account_nonce: u64 },

    #[error("Nonce {nonce} would leave a gap; next expected is {expected}")]
    NonceGap { nonce: u64, expected: u64 },

    #[error("Sender already has {limit} pending transactions")]
    SenderLimit { limit: usize },

    #[error("Replacement fee {offered} below required {required}")]
    FeeTooLowToReplace { offered: u64, required: u64 },

    #[error("Fee per byte {offered} does not beat the pool minimum {minimum}")]
    FeeTooLowForFullPool { offered: u64, minimum: u64 },

    #[error("Fee per byte {offered} below the entrance floor {floor}")]
    FeeBelowEntranceFloor { offered: u64, floor: u64 },

    #[error("Rejected by state verification: {0}")]
    Verification(String),

    #[error("Storage error during admission: {0}")]
    Storage(String),
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
    /// Replaced by a same-nonce transaction paying the premium.
    Replaced,
    /// Nonce already consumed on chain.
    StaleNonce,
}

/// A transaction that left the pool, with the reason.
#[derive(Debug, Clone)]
pub struct RemovedTransaction {
    pub id: Hash,
    pub reason: RemovalReason,
}

/// The outcome of a successful admission.
#[derive(Debug)]
pub struct AdmitOutcome {
    pub id: Hash,
    /// Transactions evicted to make room (replacement or pool-full).
    pub removed: Vec<RemovedTransaction>,
}

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: Arc<Transaction>,
    fee_per_byte: u64,
    size: usize,
    /// Monotone admission counter; the deterministic eviction tiebreak.
    arrival: u64,
    added_at: Duration,
}

/// The transaction pool.
///
/// Uses plain maps with sort-on-demand selection; access is serialized by
/// the node event loop, so there is no internal locking.
pub struct TransactionPool {
    config: PoolConfig,
    by_id: HashMap<Hash, PoolEntry>,
    /// Per sender: nonce → transaction id, gap-free by construction.
    by_sender: HashMap<Address, BTreeMap<u64, Hash>>,
    arrival_seq: u64,
}

impl TransactionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            by_id: HashMap::new(),
            by_sender: HashMap::new(),
            arrival_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &Hash) -> Option<Arc<Transaction>> {
        self.by_id.get(id).map(|e| Arc::clone(&e.tx))
    }

    /// Full transactions for announced ids, for serving `get_transactions`.
    pub fn get_many(&self, ids: &[Hash]) -> Vec<Transaction> {
        ids.iter()
            .filter_map(|id| self.by_id.get(id).map(|e| (*e.tx).clone()))
            .collect()
    }

    /// Ids not currently pooled, for deciding what to fetch on an announce.
    pub fn unknown_ids(&self, ids: &[Hash]) -> Vec<Hash> {
        ids.iter().filter(|id| !self.by_id.contains_key(id)).copied().collect()
    }

    /// Every pooled transaction, for the operator surface mirror.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.by_id.values().map(|e| (*e.tx).clone()).collect()
    }

    /// Admit a transaction.
    ///
    /// `verify` receives the sender's would-be pending run (existing
    /// transactions plus the candidate, in nonce order) and is expected to
    /// run the processor's transaction verification against a fresh
    /// snapshot.
    pub fn admit(
        &mut self,
        tx: Transaction,
        data: &DataAccess,
        now: Duration,
        verify: impl FnOnce(&[Transaction]) -> Result<(), String>,
    ) -> Result<AdmitOutcome, PoolError> {
        let id = tx.id();

        // 1. Quick dedup by id.
        if self.by_id.contains_key(&id) {
            return Err(PoolError::Duplicate);
        }

        // 2. Schema, signature, static validation.
        tx.static_validate()?;

        let sender = tx.sender_address();
        let account_nonce = data
            .get_account_or_default(&sender)
            .map_err(|e| PoolError::Storage(e.to_string()))?
            .nonce;

        // 3. Nonce floor.
        if tx.nonce < account_nonce {
            return Err(PoolError::NonceTooLow { nonce: tx.nonce, account_nonce });
        }

        let fee_per_byte = tx.fee_per_byte();
        if fee_per_byte < self.config.min_entrance_fee_per_byte {
            return Err(PoolError::FeeBelowEntranceFloor {
                offered: fee_per_byte,
                floor: self.config.min_entrance_fee_per_byte,
            });
        }

        let mut removed = Vec::new();

        // 4. Per-sender rules: same-nonce replacement pays the premium;
        // otherwise the nonce must extend the gap-free run, within the
        // per-sender bound.
        let empty = BTreeMap::new();
        let queue = self.by_sender.get(&sender).unwrap_or(&empty);
        if let Some(existing_id) = queue.get(&tx.nonce).copied() {
            let existing_fee = self.by_id[&existing_id].tx.fee;
            let required = existing_fee
                .saturating_mul(self.config.replace_factor_percent)
                .div_ceil(100);
            if tx.fee < required {
                return Err(PoolError::FeeTooLowToReplace { offered: tx.fee, required });
            }
            removed.push(RemovedTransaction { id: existing_id, reason: RemovalReason::Replaced });
        } else {
            let expected = account_nonce + queue.len() as u64;
            if tx.nonce != expected {
                return Err(PoolError::NonceGap { nonce: tx.nonce, expected });
            }
            if queue.len() >= self.config.max_per_sender {
                return Err(PoolError::SenderLimit { limit: self.config.max_per_sender });
            }
        }

        // 5. Global bound: evict the cheapest entry, rejecting the candidate
        // if it does not beat that minimum.
        let replacing = !removed.is_empty();
        if !replacing && self.by_id.len() >= self.config.max_transactions {
            let Some((victim_sender, minimum)) = self.cheapest_sender() else {
                return Err(PoolError::FeeTooLowForFullPool { offered: fee_per_byte, minimum: 0 });
            };
            if fee_per_byte <= minimum {
                return Err(PoolError::FeeTooLowForFullPool { offered: fee_per_byte, minimum });
            }
            if victim_sender == sender {
                // Evicting our own queue tail to append a higher nonce would
                // leave a gap in the run.
                return Err(PoolError::FeeTooLowForFullPool { offered: fee_per_byte, minimum });
            }
            // Evict the victim sender's highest nonce to keep its run gap-free.
            if let Some(victim_id) = self
                .by_sender
                .get(&victim_sender)
                .and_then(|q| q.iter().next_back().map(|(_, id)| *id))
            {
                removed.push(RemovedTransaction { id: victim_id, reason: RemovalReason::Evicted });
            }
        }

        // 6. Semantic verification of the sender's would-be run against a
        // fresh snapshot (the processor supplies the callback).
        let mut run: Vec<Transaction> = self
            .by_sender
            .get(&sender)
            .map(|queue| {
                queue
                    .values()
                    .filter(|existing| **existing != id)
                    .filter_map(|existing| self.by_id.get(existing))
                    .filter(|entry| entry.tx.nonce != tx.nonce)
                    .map(|entry| (*entry.tx).clone())
                    .collect()
            })
            .unwrap_or_default();
        run.push(tx.clone());
        run.sort_by_key(|t| t.nonce);
        verify(&run).map_err(PoolError::Verification)?;

        // Commit: apply evictions, then insert.
        for removal in &removed {
            self.remove_by_id(&removal.id);
        }
        let entry = PoolEntry {
            fee_per_byte,
            size: tx.size(),
            arrival: self.arrival_seq,
            added_at: now,
            tx: Arc::new(tx),
        };
        self.arrival_seq += 1;
        self.by_sender.entry(sender).or_default().insert(entry.tx.nonce, id);
        self.by_id.insert(id, entry);
        trace!(%id, pool_size = self.by_id.len(), "Transaction admitted");

        Ok(AdmitOutcome { id, removed })
    }

    /// The sender owning the cheapest pooled transaction, with that minimum
    /// fee per byte. Deterministic: ties break on the earliest arrival.
    fn cheapest_sender(&self) -> Option<(Address, u64)> {
        self.by_id
            .values()
            .min_by_key(|e| (e.fee_per_byte, e.arrival))
            .map(|e| (e.tx.sender_address(), e.fee_per_byte))
    }

    /// Select transactions for a block payload.
    ///
    /// Senders are ordered by the fee per byte at the top of their queue
    /// (descending, arrival ascending on ties); within a sender, nonce
    /// order. A sender's run stops at the first transaction that does not
    /// fit the remaining budget — skipping inside a run would leave a gap.
    pub fn select_for_block(&self, max_payload_bytes: usize) -> Vec<Transaction> {
        let mut sender_order: Vec<(u64, u64, Address)> = self
            .by_sender
            .iter()
            .filter_map(|(sender, queue)| {
                let head = queue.values().next()?;
                let entry = self.by_id.get(head)?;
                Some((entry.fee_per_byte, entry.arrival, *sender))
            })
            .collect();
        sender_order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut selected = Vec::new();
        let mut budget = max_payload_bytes;
        for (_, _, sender) in sender_order {
            for id in self.by_sender[&sender].values() {
                let entry = &self.by_id[id];
                if entry.size > budget {
                    break;
                }
                budget -= entry.size;
                selected.push((*entry.tx).clone());
            }
        }
        selected
    }

    /// Evict everything invalidated by an applied block: included ids and
    /// per-sender nonces the chain has moved past.
    pub fn on_block_applied(
        &mut self,
        block: &Block,
        data: &DataAccess,
    ) -> Vec<RemovedTransaction> {
        let mut removed = Vec::new();
        for tx in &block.payload {
            let id = tx.id();
            if self.remove_by_id(&id) {
                removed.push(RemovedTransaction { id, reason: RemovalReason::Included });
            }
        }

        let senders: Vec<Address> = block.payload.iter().map(|tx| tx.sender_address()).collect();
        for sender in senders {
            let Ok(account) = data.get_account_or_default(&sender) else {
                continue;
            };
            let stale: Vec<Hash> = self
                .by_sender
                .get(&sender)
                .map(|queue| {
                    queue
                        .range(..account.nonce)
                        .map(|(_, id)| *id)
                        .collect()
                })
                .unwrap_or_default();
            for id in stale {
                if self.remove_by_id(&id) {
                    removed.push(RemovedTransaction { id, reason: RemovalReason::StaleNonce });
                }
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "Evicted transactions after block apply");
        }
        removed
    }

    /// Re-admit the payload of a reverted block. Admissions that now fail
    /// are silently dropped; already-present ids are ignored.
    pub fn on_block_reverted(
        &mut self,
        block: &Block,
        data: &DataAccess,
        now: Duration,
        mut verify: impl FnMut(&[Transaction]) -> Result<(), String>,
    ) -> usize {
        let mut readmitted = 0;
        for tx in &block.payload {
            match self.admit(tx.clone(), data, now, &mut verify) {
                Ok(_) => readmitted += 1,
                Err(PoolError::Duplicate) => {}
                Err(e) => trace!(id = %tx.id(), error = %e, "Dropped reverted transaction"),
            }
        }
        readmitted
    }

    /// Evict transactions older than the expiry interval.
    pub fn sweep_expired(&mut self, now: Duration) -> Vec<RemovedTransaction> {
        let expired: Vec<Hash> = self
            .by_id
            .values()
            .filter(|e| now.saturating_sub(e.added_at) >= self.config.expiry_interval)
            .map(|e| e.tx.id())
            .collect();
        let mut removed = Vec::new();
        for id in expired {
            if self.remove_by_id(&id) {
                removed.push(RemovedTransaction { id, reason: RemovalReason::Expired });
            }
        }
        removed
    }

    fn remove_by_id(&mut self, id: &Hash) -> bool {
        let Some(entry) = self.by_id.remove(id) else {
            return false;
        };
        let sender = entry.tx.sender_address();
        if let Some(queue) = self.by_sender.get_mut(&sender) {
            queue.remove(&entry.tx.nonce);
            if queue.is_empty() {
                self.by_sender.remove(&sender);
            }
        }
        true
    }
}

impl std::fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionPool")
            .field("size", &self.by_id.len())
            .field("senders", &self.by_sender.len())
            .finish()
    }
}
