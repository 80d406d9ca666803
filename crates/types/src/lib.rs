//! Core types for the forgeline node.
//!
//! This crate provides the foundational types used throughout the node:
//!
//! - **Primitives**: [`Hash`], [`Address`], cryptographic keys and signatures
//! - **Containers**: [`Block`], [`BlockHeader`], [`Transaction`], [`Account`]
//! - **Consensus helpers**: [`ValidatorSet`], [`Slots`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.
//!
//! Every consensus-visible container derives `BasicSbor`: the SBOR encoding of
//! blocks, transactions and accounts is part of the consensus contract and must
//! be bit-identical across implementations.

mod account;
mod block;
mod crypto;
mod hash;
mod identifiers;
mod slots;
mod transaction;
mod validator;

pub use account::{Account, DelegateInfo, Vote};
pub use block::{merkle_root, Block, BlockAsset, BlockHeader};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use identifiers::{Address, PeerId};
pub use slots::Slots;
pub use transaction::{
    Transaction, TransactionAsset, TransactionError, VoteAmount, MAX_DATA_LENGTH,
    MAX_VOTES_PER_TRANSACTION,
};
pub use validator::ValidatorSet;

/// Test utilities shared across the workspace test suites.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic keypair from a seed byte.
    pub fn test_keypair(seed: u8) -> KeyPair {
        KeyPair::from_passphrase(&format!("test passphrase {seed}"))
    }

    /// Address of the deterministic test keypair for a seed byte.
    pub fn test_address(seed: u8) -> Address {
        Address::from_public_key(&test_keypair(seed).public_key())
    }

    /// A signed transfer transaction between two seeded accounts.
    pub fn test_transfer(sender_seed: u8, recipient_seed: u8, nonce: u64, fee: u64) -> Transaction {
        let sender = test_keypair(sender_seed);
        let mut tx = Transaction::new(
            nonce,
            fee,
            sender.public_key(),
            TransactionAsset::Transfer {
                recipient: test_address(recipient_seed),
                amount: 1_000,
                data: Vec::new(),
            },
        );
        tx.sign(&sender);
        tx
    }
}
