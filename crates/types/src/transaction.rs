//! Transaction container and static validation.

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::hash::Hash;
use crate::identifiers::Address;
use thiserror::Error;

/// Maximum length of the free-form data field on a transfer.
pub const MAX_DATA_LENGTH: usize = 64;

/// Maximum number of votes a single transaction may cast.
pub const MAX_VOTES_PER_TRANSACTION: usize = 20;

/// Maximum length of a delegate username.
const MAX_USERNAME_LENGTH: usize = 20;

/// Errors from static transaction validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Module/asset id ({module_id}, {asset_id}) does not match the asset payload")]
    AssetIdMismatch { module_id: u32, asset_id: u32 },

    #[error("Transfer data exceeds {MAX_DATA_LENGTH} bytes")]
    DataTooLong,

    #[error("Delegate username is empty or longer than {MAX_USERNAME_LENGTH} characters")]
    InvalidUsername,

    #[error("Vote list is empty or larger than {MAX_VOTES_PER_TRANSACTION} entries")]
    InvalidVoteCount,

    #[error("Vote amount must be non-zero")]
    ZeroVoteAmount,

    #[error("Transaction carries no signature")]
    MissingSignature,

    #[error("Signature does not verify under the sender public key")]
    InvalidSignature,
}

/// A single vote entry. Positive amounts stake, negative amounts unstake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct VoteAmount {
    pub delegate: Address,
    pub amount: i64,
}

/// The closed sum of transaction payloads.
///
/// Module dispatch is a static table keyed by `(module_id, asset_id)`;
/// the variants here carry the per-module schemas.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub enum TransactionAsset {
    /// Token transfer (module 2, asset 0).
    Transfer {
        recipient: Address,
        amount: u64,
        data: Vec<u8>,
    },
    /// Delegate registration (module 5, asset 0).
    RegisterDelegate { username: String },
    /// Vote casting (module 5, asset 1).
    CastVotes { votes: Vec<VoteAmount> },
}

impl TransactionAsset {
    /// The `(module_id, asset_id)` pair this payload belongs to.
    pub fn ids(&self) -> (u32, u32) {
        match self {
            TransactionAsset::Transfer { .. } => (2, 0),
            TransactionAsset::RegisterDelegate { .. } => (5, 0),
            TransactionAsset::CastVotes { .. } => (5, 1),
        }
    }
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Transaction {
    pub module_id: u32,
    pub asset_id: u32,
    /// Sender account nonce this transaction consumes.
    pub nonce: u64,
    /// Fee in beddows, paid by the sender.
    pub fee: u64,
    pub sender_public_key: PublicKey,
    pub asset: TransactionAsset,
    pub signatures: Vec<Signature>,
}

impl Transaction {
    /// Build an unsigned transaction; module and asset ids are derived from
    /// the payload so they cannot disagree at construction.
    pub fn new(nonce: u64, fee: u64, sender_public_key: PublicKey, asset: TransactionAsset) -> Self {
        let (module_id, asset_id) = asset.ids();
        Self {
            module_id,
            asset_id,
            nonce,
            fee,
            sender_public_key,
            asset,
            signatures: Vec::new(),
        }
    }

    /// The transaction id: digest of the full encoded transaction.
    pub fn id(&self) -> Hash {
        let bytes = sbor::basic_encode(self)
            .expect("transaction encoding must succeed - this is a bug if it fails");
        Hash::digest(&bytes)
    }

    /// The bytes the sender signs: the transaction with signatures cleared.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        sbor::basic_encode(&unsigned)
            .expect("transaction encoding must succeed - this is a bug if it fails")
    }

    /// Sign with the sender keypair, appending the signature.
    pub fn sign(&mut self, keypair: &KeyPair) {
        let signature = keypair.sign(&self.unsigned_bytes());
        self.signatures.push(signature);
    }

    /// Sender address, derived from the sender public key.
    pub fn sender_address(&self) -> Address {
        Address::from_public_key(&self.sender_public_key)
    }

    /// Encoded size in bytes. This is the size fee policy is charged on.
    pub fn size(&self) -> usize {
        sbor::basic_encode(self)
            .expect("transaction encoding must succeed - this is a bug if it fails")
            .len()
    }

    /// Fee per encoded byte, the pool's priority key.
    pub fn fee_per_byte(&self) -> u64 {
        let size = self.size().max(1) as u64;
        self.fee / size
    }

    /// Static validation: schema shape and the first signature.
    ///
    /// Purely local; state-dependent checks (nonce, balance, module
    /// preconditions) live in the verify stage.
    pub fn static_validate(&self) -> Result<(), TransactionError> {
        if self.asset.ids() != (self.module_id, self.asset_id) {
            return Err(TransactionError::AssetIdMismatch {
                module_id: self.module_id,
                asset_id: self.asset_id,
            });
        }

        match &self.asset {
            TransactionAsset::Transfer { data, .. } => {
                if data.len() > MAX_DATA_LENGTH {
                    return Err(TransactionError::DataTooLong);
                }
            }
            TransactionAsset::RegisterDelegate { username } => {
                if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
                    return Err(TransactionError::InvalidUsername);
                }
            }
            TransactionAsset::CastVotes { votes } => {
                if votes.is_empty() || votes.len() > MAX_VOTES_PER_TRANSACTION {
                    return Err(TransactionError::InvalidVoteCount);
                }
                if votes.iter().any(|v| v.amount == 0) {
                    return Err(TransactionError::ZeroVoteAmount);
                }
            }
        }

        let Some(signature) = self.signatures.first() else {
            return Err(TransactionError::MissingSignature);
        };
        if !self.sender_public_key.verify(&self.unsigned_bytes(), signature) {
            return Err(TransactionError::InvalidSignature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_address, test_keypair, test_transfer};

    #[test]
    fn signed_transfer_passes_static_validation() {
        let tx = test_transfer(1, 2, 0, 500);
        assert_eq!(tx.static_validate(), Ok(()));
    }

    #[test]
    fn unsigned_transaction_is_rejected() {
        let kp = test_keypair(1);
        let tx = Transaction::new(
            0,
            500,
            kp.public_key(),
            TransactionAsset::Transfer {
                recipient: test_address(2),
                amount: 10,
                data: Vec::new(),
            },
        );
        assert_eq!(tx.static_validate(), Err(TransactionError::MissingSignature));
    }

    #[test]
    fn tampered_fee_invalidates_signature() {
        let mut tx = test_transfer(1, 2, 0, 500);
        tx.fee = 1;
        assert_eq!(tx.static_validate(), Err(TransactionError::InvalidSignature));
    }

    #[test]
    fn mismatched_ids_are_rejected() {
        let mut tx = test_transfer(1, 2, 0, 500);
        tx.module_id = 5;
        assert!(matches!(
            tx.static_validate(),
            Err(TransactionError::AssetIdMismatch { .. })
        ));
    }

    #[test]
    fn oversized_data_is_rejected() {
        let kp = test_keypair(1);
        let mut tx = Transaction::new(
            0,
            500,
            kp.public_key(),
            TransactionAsset::Transfer {
                recipient: test_address(2),
                amount: 10,
                data: vec![0u8; MAX_DATA_LENGTH + 1],
            },
        );
        tx.sign(&kp);
        assert_eq!(tx.static_validate(), Err(TransactionError::DataTooLong));
    }

    #[test]
    fn vote_shape_is_checked() {
        let kp = test_keypair(1);
        let mut tx = Transaction::new(
            0,
            500,
            kp.public_key(),
            TransactionAsset::CastVotes { votes: Vec::new() },
        );
        tx.sign(&kp);
        assert_eq!(tx.static_validate(), Err(TransactionError::InvalidVoteCount));

        let mut tx = Transaction::new(
            0,
            500,
            kp.public_key(),
            TransactionAsset::CastVotes {
                votes: vec![VoteAmount { delegate: test_address(3), amount: 0 }],
            },
        );
        tx.sign(&kp);
        assert_eq!(tx.static_validate(), Err(TransactionError::ZeroVoteAmount));
    }

    #[test]
    fn id_is_stable_across_codec_round_trip() {
        let tx = test_transfer(3, 4, 7, 321);
        let bytes = sbor::basic_encode(&tx).unwrap();
        let decoded: Transaction = sbor::basic_decode(&bytes).unwrap();
        assert_eq!(decoded.id(), tx.id());
        assert_eq!(decoded, tx);
    }
}
