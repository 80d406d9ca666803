//! Node configuration.

use forgeline_forger::DelegateConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("forging.wait_threshold ({wait_threshold}s) must be smaller than genesis.block_time ({block_time}s)")]
    WaitThresholdTooLarge { wait_threshold: u32, block_time: u32 },

    #[error("genesis.block_time must be positive")]
    ZeroBlockTime,

    #[error("genesis.round_length must be positive")]
    ZeroRoundLength,

    #[error("genesis.bft_threshold must be positive")]
    ZeroBftThreshold,
}

/// Consensus parameters fixed at genesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisOptions {
    /// Unix timestamp of genesis; the start of slot 0.
    pub timestamp: u32,
    /// Slot width in seconds.
    pub block_time: u32,
    /// Slots per round; also the active validator set size.
    pub round_length: u32,
    /// Distance of the finality threshold: height `h` finalizes once the
    /// block at `h + bft_threshold` confirms it.
    pub bft_threshold: u64,
    /// Block payload byte cap.
    pub max_payload_length: usize,
    /// Fee policy.
    pub min_fee_per_byte: u64,
    pub base_fees: Vec<BaseFeeOptions>,
    /// Per-block reward schedule.
    pub rewards: RewardsOptions,
}

impl Default for GenesisOptions {
    fn default() -> Self {
        Self {
            timestamp: 0,
            block_time: 10,
            round_length: 103,
            bft_threshold: 103,
            max_payload_length: 15 * 1024,
            min_fee_per_byte: 1,
            base_fees: vec![BaseFeeOptions { module_id: 5, asset_id: 0, base_fee: 1_000_000_000 }],
            rewards: RewardsOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaseFeeOptions {
    pub module_id: u32,
    pub asset_id: u32,
    pub base_fee: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsOptions {
    pub milestones: Vec<u64>,
    pub offset: u64,
    pub distance: u64,
}

impl Default for RewardsOptions {
    fn default() -> Self {
        Self {
            milestones: vec![500_000_000, 400_000_000, 300_000_000, 200_000_000, 100_000_000],
            offset: 2_160,
            distance: 3_000_000,
        }
    }
}

/// Forging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgingOptions {
    /// Seconds into the slot to wait for transactions before forging anyway.
    pub wait_threshold: u32,
    /// Skip the wait gate (test override).
    pub force: bool,
    /// Password applied to all delegates at boot when set.
    pub default_password: Option<String>,
    /// Forge tick interval in milliseconds.
    pub forge_interval_ms: u64,
    /// Forge early only once this many transactions are pending.
    pub min_pending_transactions: usize,
    pub delegates: Vec<DelegateConfig>,
}

impl Default for ForgingOptions {
    fn default() -> Self {
        Self {
            wait_threshold: 2,
            force: false,
            default_password: None,
            forge_interval_ms: 1_000,
            min_pending_transactions: 1,
            delegates: Vec::new(),
        }
    }
}

/// Peer network options. The transport itself is an external collaborator;
/// these options parameterize the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub network_version: String,
    pub max_peers: usize,
    pub seed_peers: Vec<String>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self { network_version: "2.0".to_string(), max_peers: 100, seed_peers: Vec::new() }
    }
}

/// Transaction pool options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub max_transactions: usize,
    pub max_per_sender: usize,
    pub replace_factor_percent: u64,
    pub expiry_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub min_entrance_fee_per_byte: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_transactions: 4096,
            max_per_sender: 64,
            replace_factor_percent: 110,
            expiry_interval_secs: 3 * 60 * 60,
            sweep_interval_secs: 60,
            min_entrance_fee_per_byte: 0,
        }
    }
}

/// Synchronizer options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub min_tip_agreement: usize,
    pub max_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { min_tip_agreement: 3, max_retries: 3 }
    }
}

/// The full node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub genesis: GenesisOptions,
    pub forging: ForgingOptions,
    pub network: NetworkOptions,
    pub pool: PoolOptions,
    pub sync: SyncOptions,
}

impl NodeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Boot-time invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.genesis.block_time == 0 {
            return Err(ConfigError::ZeroBlockTime);
        }
        if self.genesis.round_length == 0 {
            return Err(ConfigError::ZeroRoundLength);
        }
        if self.genesis.bft_threshold == 0 {
            return Err(ConfigError::ZeroBftThreshold);
        }
        if self.forging.wait_threshold >= self.genesis.block_time {
            return Err(ConfigError::WaitThresholdTooLarge {
                wait_threshold: self.forging.wait_threshold,
                block_time: self.genesis.block_time,
            });
        }
        Ok(())
    }
}
