//! Operator surface.
//!
//! A typed handle over the running node: status queries answer from caches
//! the runner refreshes after every dispatch, reads go through the shared
//! [`DataAccess`] view, and mutations are events on the node's channel. Ids
//! are binary inside the node; this surface is where base64 appears.

use crate::network::PeerNetwork;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use forgeline_chain::{DataAccess, StorageError, TransactionModule};
use forgeline_core::{ChainEvent, Event};
use forgeline_types::{Account, Address, Block, Hash, PeerId, Transaction};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Errors from the operator surface.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Node is shutting down")]
    NodeUnavailable,

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Mutable node status mirrored for cheap queries.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub height: u64,
    pub finalized_height: u64,
    pub last_block_id: Hash,
    pub syncing: bool,
    pub pool_size: usize,
    pub validators: Vec<Address>,
    pub network_version: String,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            height: 0,
            finalized_height: 0,
            last_block_id: Hash::ZERO,
            syncing: false,
            pool_size: 0,
            validators: Vec::new(),
            network_version: String::new(),
        }
    }
}

/// Node information as served to operators.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub height: u64,
    pub finalized_height: u64,
    /// Base64-encoded id of the tip block.
    pub last_block_id: String,
    pub syncing: bool,
    pub unconfirmed_transactions: usize,
    pub network_version: String,
}

/// The composed schema: one entry per registered module.
#[derive(Debug, Clone)]
pub struct ModuleSchema {
    pub id: u32,
    pub name: &'static str,
    pub account_schema: &'static [&'static str],
    pub transaction_assets: &'static [u32],
}

/// A typed handle to the running node.
#[derive(Clone)]
pub struct NodeHandle {
    event_tx: mpsc::Sender<Event>,
    events: broadcast::Sender<ChainEvent>,
    status: Arc<RwLock<NodeStatus>>,
    pool_mirror: Arc<RwLock<HashMap<Hash, Transaction>>>,
    data: DataAccess,
    network: Arc<dyn PeerNetwork>,
}

impl NodeHandle {
    pub(crate) fn new(
        event_tx: mpsc::Sender<Event>,
        events: broadcast::Sender<ChainEvent>,
        status: Arc<RwLock<NodeStatus>>,
        pool_mirror: Arc<RwLock<HashMap<Hash, Transaction>>>,
        data: DataAccess,
        network: Arc<dyn PeerNetwork>,
    ) -> Self {
        Self { event_tx, events, status, pool_mirror, data, network }
    }

    /// Subscribe to the node's notification bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Current node status.
    pub fn get_node_info(&self) -> NodeInfo {
        let status = self.status.read();
        NodeInfo {
            height: status.height,
            finalized_height: status.finalized_height,
            last_block_id: BASE64.encode(status.last_block_id.as_bytes()),
            syncing: status.syncing,
            unconfirmed_transactions: status.pool_size,
            network_version: status.network_version.clone(),
        }
    }

    /// The active validator set.
    pub fn get_validators(&self) -> Vec<Address> {
        self.status.read().validators.clone()
    }

    /// Enable or disable forging for a delegate.
    pub async fn update_forging_status(
        &self,
        address: Address,
        password: String,
        enabled: bool,
    ) -> Result<(), HandleError> {
        self.event_tx
            .send(Event::UpdateForgingStatus { address, password, enabled })
            .await
            .map_err(|_| HandleError::NodeUnavailable)
    }

    /// Submit a transaction.
    pub async fn post_transaction(&self, transaction: Transaction) -> Result<String, HandleError> {
        let id = transaction.id();
        self.event_tx
            .send(Event::TransactionReceived { transaction: Box::new(transaction), from: None })
            .await
            .map_err(|_| HandleError::NodeUnavailable)?;
        Ok(BASE64.encode(id.as_bytes()))
    }

    /// The account at `address`, if it exists.
    pub fn get_account(&self, address: &Address) -> Result<Option<Account>, HandleError> {
        Ok(self.data.get_account(address)?)
    }

    /// A block by its base64-encoded id.
    pub fn get_block_by_id(&self, id: &str) -> Result<Option<Block>, HandleError> {
        let hash = decode_id(id)?;
        Ok(self.data.get_block_by_id(&hash)?)
    }

    /// A block by height on the canonical chain.
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, HandleError> {
        Ok(self.data.get_block_by_height(height)?)
    }

    /// Blocks in an inclusive height range.
    pub fn get_blocks_by_height_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<Block>, HandleError> {
        Ok(self.data.get_blocks_by_height_range(from, to)?)
    }

    /// The current tip.
    pub fn get_last_block(&self) -> Result<Option<Block>, HandleError> {
        match self.data.tip_id()? {
            Some(id) => Ok(self.data.get_block_by_id(&id)?),
            None => Ok(None),
        }
    }

    /// A pooled transaction by its base64-encoded id.
    pub fn get_transaction_by_id(&self, id: &str) -> Result<Option<Transaction>, HandleError> {
        let hash = decode_id(id)?;
        Ok(self.pool_mirror.read().get(&hash).cloned())
    }

    /// Pooled transactions for a list of base64-encoded ids.
    pub fn get_transactions_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<Transaction>, HandleError> {
        let mirror = self.pool_mirror.read();
        let mut transactions = Vec::new();
        for id in ids {
            if let Some(tx) = mirror.get(&decode_id(id)?) {
                transactions.push(tx.clone());
            }
        }
        Ok(transactions)
    }

    /// Currently connected peers.
    pub fn get_connected_peers(&self) -> Vec<PeerId> {
        self.network.connected_peers()
    }

    /// The account and transaction schema composed from the module table.
    /// The module set is fixed at boot, so this is a constant of the build.
    pub fn get_schema(&self) -> Vec<ModuleSchema> {
        forgeline_chain::ModuleRegistry::builtin()
            .modules()
            .map(|module| ModuleSchema {
                id: module.id(),
                name: module.name(),
                account_schema: module.account_schema(),
                transaction_assets: module.transaction_assets(),
            })
            .collect()
    }
}

fn decode_id(id: &str) -> Result<Hash, HandleError> {
    let bytes = BASE64
        .decode(id)
        .map_err(|e| HandleError::InvalidId(e.to_string()))?;
    Hash::from_slice(&bytes)
        .ok_or_else(|| HandleError::InvalidId(format!("expected 32 bytes, got {}", bytes.len())))
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").finish_non_exhaustive()
    }
}
