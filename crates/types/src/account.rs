//! Account state.

use crate::crypto::PublicKey;
use crate::identifiers::Address;

/// A vote an account currently has staked on a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Vote {
    pub delegate: Address,
    pub amount: u64,
}

/// Delegate registration data on an account.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct DelegateInfo {
    pub username: String,
    /// Sum of all vote amounts currently cast on this delegate.
    pub total_votes_received: u64,
}

/// Materialized account state.
///
/// The account schema is the composition of the module contributions:
/// balance and nonce from the token module, `delegate` and `votes` from the
/// dpos module. The set of modules is fixed at boot, so the schema is a
/// plain struct rather than a runtime composition.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    /// Next nonce this account will accept.
    pub nonce: u64,
    /// Set on first outgoing transaction.
    pub public_key: Option<PublicKey>,
    pub delegate: Option<DelegateInfo>,
    pub votes: Vec<Vote>,
}

impl Account {
    /// A fresh account with zero balance and nonce.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
            public_key: None,
            delegate: None,
            votes: Vec::new(),
        }
    }

    /// Whether this account is a registered delegate.
    pub fn is_delegate(&self) -> bool {
        self.delegate.is_some()
    }
}
