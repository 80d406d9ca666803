//! Unconfirmed transaction pool.
//!
//! Holds transactions organized for fast admission and fair selection:
//! deduplicated by id, per-sender gap-free nonce runs, prioritized by fee
//! per byte, expired by arrival age. Admission is guarded by a validator
//! callback the processor supplies, so pool-dependent semantic failures are
//! caught with a fresh state snapshot before a transaction is gossiped.

mod state;

pub use state::{
    AdmitOutcome, PoolConfig, PoolError, RemovalReason, RemovedTransaction, TransactionPool,
};
