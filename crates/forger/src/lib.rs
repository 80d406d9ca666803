//! Block production.
//!
//! The forger schedules block production for locally unlocked delegates:
//! a cooperative tick checks the slot assignment, the wait-threshold gate
//! and the hash-onion ledger, then builds, signs and hands the block to the
//! processor. Delegate keys are decrypted on demand and held in memory only.

mod forger;
mod hash_onion;
mod keys;

pub use forger::{DelegateConfig, Forger, ForgerConfig};
pub use hash_onion::{HashOnion, HashOnionConfig};
pub use keys::{EncryptedPassphrase, KeyError};
