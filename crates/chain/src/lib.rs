//! Chain state for the forgeline node.
//!
//! The chain uniquely owns the persisted state. Every logical write is a
//! single atomic batch covering block bytes, updated accounts, module state,
//! BFT records, the undo-journal delta and the tip pointer. Reads go through
//! [`DataAccess`] (shared, read-only) or a [`StateStore`] (copy-on-write
//! snapshot scoped to one block apply).

mod chain;
mod data_access;
mod journal;
mod modules;
mod policy;
mod state_store;
mod store;

pub mod keys;

pub use chain::{Chain, ChainConfig, ChainError, InitOutcome};
pub use data_access::DataAccess;
pub use journal::JournalEntry;
pub use modules::{
    ApplyContext, BlockContext, DposModule, ModuleError, ModuleRegistry, TokenModule,
    TransactionModule,
};
pub use policy::{BaseFee, FeePolicy, RewardSchedule};
pub use state_store::{StateDiff, StateStore};
pub use store::{KvStore, MemoryStore, StorageError, WriteBatch, WriteOp};
