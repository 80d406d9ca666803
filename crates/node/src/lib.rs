//! The composed forgeline node.
//!
//! [`NodeStateMachine`] wires the processor, transaction pool, forger and
//! synchronizer together behind the [`forgeline_core::StateMachine`] trait:
//! one `handle` call per event, strictly serial, with every side effect
//! expressed as an action for the runner to execute.

mod config;
mod genesis;
mod state;

pub use config::{
    ConfigError, ForgingOptions, GenesisOptions, NetworkOptions, NodeConfig, PoolOptions,
    RewardsOptions, SyncOptions,
};
pub use genesis::create_genesis_block;
pub use state::{NodeError, NodeStateMachine};
