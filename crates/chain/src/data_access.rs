//! Shared read-only view over persisted chain state.

use crate::keys;
use crate::store::{KvStore, StorageError};
use forgeline_types::{Account, Address, Block, Hash};
use std::sync::Arc;

/// Read-only access to persisted chain state.
///
/// Cloneable and cheap; every component other than the processor holds one
/// of these instead of a mutable chain reference.
#[derive(Clone)]
pub struct DataAccess {
    store: Arc<dyn KvStore>,
}

impl DataAccess {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn decode<T: sbor::BasicDecode>(key: &[u8], bytes: &[u8]) -> Result<T, StorageError> {
        sbor::basic_decode(bytes).map_err(|e| StorageError::Corrupted {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: format!("{e:?}"),
        })
    }

    /// The stored account at `address`, if it exists.
    pub fn get_account(&self, address: &Address) -> Result<Option<Account>, StorageError> {
        let key = keys::account(address);
        match self.store.get(&key)? {
            Some(bytes) => Ok(Some(Self::decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// The stored account at `address`, or a fresh default.
    pub fn get_account_or_default(&self, address: &Address) -> Result<Account, StorageError> {
        Ok(self.get_account(address)?.unwrap_or_else(|| Account::new(*address)))
    }

    /// The block with the given id.
    pub fn get_block_by_id(&self, id: &Hash) -> Result<Option<Block>, StorageError> {
        let key = keys::block_by_id(id);
        match self.store.get(&key)? {
            Some(bytes) => Ok(Some(Self::decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// The id of the block at `height` on the canonical chain.
    pub fn get_block_id_at_height(&self, height: u64) -> Result<Option<Hash>, StorageError> {
        let key = keys::block_by_height(height);
        match self.store.get(&key)? {
            Some(bytes) => Hash::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| StorageError::Corrupted {
                    key: format!("blocks:height:{height}"),
                    reason: "id is not 32 bytes".to_string(),
                }),
            None => Ok(None),
        }
    }

    /// The block at `height` on the canonical chain.
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        match self.get_block_id_at_height(height)? {
            Some(id) => self.get_block_by_id(&id),
            None => Ok(None),
        }
    }

    /// Blocks in `[from, to]` by ascending height, skipping gaps.
    pub fn get_blocks_by_height_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        for height in from..=to {
            if let Some(block) = self.get_block_by_height(height)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// The persisted finalized height. Zero for a fresh store.
    pub fn finalized_height(&self) -> Result<u64, StorageError> {
        match self.store.get(keys::BFT_FINALIZED)? {
            Some(bytes) => {
                let raw: [u8; 8] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| StorageError::Corrupted {
                            key: "bft:finalized".to_string(),
                            reason: "height is not 8 bytes".to_string(),
                        })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// The id of the current tip block.
    pub fn tip_id(&self) -> Result<Option<Hash>, StorageError> {
        match self.store.get(keys::CHAIN_TIP)? {
            Some(bytes) => Hash::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| StorageError::Corrupted {
                    key: "chain:tip".to_string(),
                    reason: "id is not 32 bytes".to_string(),
                }),
            None => Ok(None),
        }
    }

    /// The highest consumed hash-onion index for a delegate.
    pub fn used_onion_index(&self, address: &Address) -> Result<Option<u32>, StorageError> {
        match self.store.get(&keys::forger_used_hashes(address))? {
            Some(bytes) => {
                let raw: [u8; 4] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| StorageError::Corrupted {
                            key: format!("forger:used_hashes:{address}"),
                            reason: "index is not 4 bytes".to_string(),
                        })?;
                Ok(Some(u32::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccess").finish_non_exhaustive()
    }
}
