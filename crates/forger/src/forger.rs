//! The forging scheduler.

use crate::hash_onion::{HashOnion, HashOnionConfig};
use crate::keys::{EncryptedPassphrase, KeyError};
use forgeline_mempool::TransactionPool;
use forgeline_processor::BlockProcessor;
use forgeline_types::{
    merkle_root, Address, Block, BlockAsset, BlockHeader, Hash, KeyPair, Signature,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Forger configuration.
#[derive(Debug, Clone)]
pub struct ForgerConfig {
    /// Header version stamped on forged blocks.
    pub block_version: u32,
    /// Seconds into the slot to wait for more transactions before forging
    /// anyway. Must be smaller than the slot width; enforced at boot.
    pub wait_threshold: u32,
    /// Skip the wait gate entirely (test override).
    pub force: bool,
    /// Payload byte budget for selection.
    pub max_payload_length: usize,
    /// Forge early only once this many transactions are pending.
    pub min_pending_transactions: usize,
}

impl Default for ForgerConfig {
    fn default() -> Self {
        Self {
            block_version: 2,
            wait_threshold: 2,
            force: false,
            max_payload_length: 15 * 1024,
            min_pending_transactions: 1,
        }
    }
}

/// Per-delegate forging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConfig {
    pub address: Address,
    pub encrypted_passphrase: EncryptedPassphrase,
    pub hash_onion: HashOnionConfig,
}

struct DelegateSlot {
    config: DelegateConfig,
    onion: HashOnion,
    /// Present only while forging is enabled.
    keypair: Option<KeyPair>,
}

/// Produces blocks during slots assigned to locally unlocked delegates.
pub struct Forger {
    config: ForgerConfig,
    delegates: HashMap<Address, DelegateSlot>,
}

impl Forger {
    /// Build the forger from configuration. Delegates with an inconsistent
    /// hash onion are skipped with a warning rather than failing boot.
    pub fn new(config: ForgerConfig, delegates: Vec<DelegateConfig>) -> Self {
        let mut slots = HashMap::new();
        for delegate in delegates {
            match HashOnion::new(delegate.hash_onion.clone()) {
                Some(onion) => {
                    slots.insert(
                        delegate.address,
                        DelegateSlot { config: delegate, onion, keypair: None },
                    );
                }
                None => {
                    warn!(address = %delegate.address, "Inconsistent hash onion; delegate skipped");
                }
            }
        }
        Self { config, delegates: slots }
    }

    /// Enable or disable forging for a delegate.
    ///
    /// Enabling decrypts the configured passphrase and keeps the keypair in
    /// memory; disabling wipes it. Returns the resulting enabled state.
    pub fn update_forging_status(
        &mut self,
        address: Address,
        password: &str,
        enabled: bool,
    ) -> Result<bool, KeyError> {
        let slot = self
            .delegates
            .get_mut(&address)
            .ok_or(KeyError::UnknownDelegate(address))?;

        if !enabled {
            slot.keypair = None;
            info!(address = %address, "Forging disabled");
            return Ok(false);
        }

        let passphrase = slot.config.encrypted_passphrase.decrypt(password, address)?;
        let keypair = KeyPair::from_passphrase(&passphrase);
        if Address::from_public_key(&keypair.public_key()) != address {
            return Err(KeyError::AddressMismatch(address));
        }
        slot.keypair = Some(keypair);
        info!(address = %address, "Forging enabled");
        Ok(true)
    }

    /// Whether forging is enabled for a delegate.
    pub fn is_forging(&self, address: &Address) -> bool {
        self.delegates
            .get(address)
            .map(|slot| slot.keypair.is_some())
            .unwrap_or(false)
    }

    /// Addresses with forging enabled.
    pub fn enabled_delegates(&self) -> Vec<Address> {
        let mut enabled: Vec<Address> = self
            .delegates
            .iter()
            .filter(|(_, slot)| slot.keypair.is_some())
            .map(|(address, _)| *address)
            .collect();
        enabled.sort();
        enabled
    }

    /// One cooperative forging tick.
    ///
    /// Returns the signed block for the current slot, or `None` when any
    /// gate holds: synchronizer active, slot not ours, key locked, wait
    /// threshold, slot already filled, or hash-onion refusal.
    pub fn on_tick(
        &self,
        processor: &BlockProcessor,
        pool: &TransactionPool,
        sync_active: bool,
        now: u32,
    ) -> Option<Block> {
        if sync_active {
            debug!("Skipping forge tick: synchronizer active");
            return None;
        }
        if self.delegates.values().all(|slot| slot.keypair.is_none()) {
            return None;
        }

        let slots = processor.slots();
        let slot = slots.slot_number(now);
        let generator = processor.chain().active_validators().generator_at(slot)?;
        let delegate = self.delegates.get(&generator)?;
        let keypair = delegate.keypair.as_ref()?;

        let last = processor.chain().last_block();
        if slots.slot_number(last.header.timestamp) == slot && last.height() > 0 {
            // Someone (possibly us) already filled this slot.
            return None;
        }

        if !self.config.force
            && slots.seconds_into_slot(now) < self.config.wait_threshold
            && pool.len() < self.config.min_pending_transactions
        {
            debug!(slot, "Waiting for more transactions before forging");
            return None;
        }

        let height = last.height() + 1;
        let reveal = match self.next_reveal(processor, &generator, delegate, height) {
            Ok(reveal) => reveal,
            Err(e) => {
                warn!(address = %generator, error = %e, "Refusing to forge");
                return None;
            }
        };

        let payload = pool.select_for_block(self.config.max_payload_length);
        let ids: Vec<Hash> = payload.iter().map(|tx| tx.id()).collect();
        let (previously_forged, max_height_prevoted) = processor.forging_info(&generator);

        let mut header = BlockHeader {
            version: self.config.block_version,
            height,
            timestamp: now,
            previous_block_id: last.id(),
            generator_public_key: keypair.public_key(),
            transaction_root: merkle_root(&ids),
            asset: BlockAsset {
                max_height_previously_forged: previously_forged,
                max_height_prevoted,
                seed_reveal: reveal,
            },
            signature: Signature::zero(),
        };
        header.sign(keypair);

        info!(height, slot, address = %generator, transactions = payload.len(), "Forged block");
        Some(Block { header, payload })
    }

    /// Resolve and persist the hash-onion layer for a block at `height`.
    ///
    /// The consumed index is written before signing, so a crash between the
    /// write and the broadcast can only waste a layer, never reuse one. An
    /// index at or below the highest recorded one refuses to forge.
    fn next_reveal(
        &self,
        processor: &BlockProcessor,
        address: &Address,
        delegate: &DelegateSlot,
        height: u64,
    ) -> Result<[u8; 16], KeyError> {
        let usage = processor.slots().round_of_height(height) as u32;
        let used = processor
            .chain()
            .used_onion_index(address)
            .map_err(|e| {
                warn!(error = %e, "Could not read onion ledger");
                KeyError::OnionExhausted(*address)
            })?;
        if let Some(used) = used {
            if usage <= used {
                return Err(KeyError::OnionLayerUsed { index: usage, used });
            }
        }
        let reveal = delegate
            .onion
            .reveal(usage)
            .ok_or(KeyError::OnionExhausted(*address))?;
        processor
            .chain()
            .record_onion_usage(address, usage)
            .map_err(|e| {
                warn!(error = %e, "Could not persist onion usage");
                KeyError::OnionExhausted(*address)
            })?;
        Ok(reveal)
    }
}

impl std::fmt::Debug for Forger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forger")
            .field("delegates", &self.delegates.len())
            .field("enabled", &self.enabled_delegates().len())
            .finish()
    }
}
