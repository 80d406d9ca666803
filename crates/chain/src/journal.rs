//! Undo journal.
//!
//! Every block apply records the prior encoded value of every key it
//! touches. Reverting the tip is then a byte-exact restore, independent of
//! module semantics. Entries are keyed by block id and deleted once the
//! block is finalized.

use forgeline_types::{Address, Hash};

/// Inverse operations for one applied block.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct JournalEntry {
    /// The block this entry can revert.
    pub block_id: Hash,
    /// Prior encoded accounts; `None` means the account did not exist.
    pub prior_accounts: Vec<(Address, Option<Vec<u8>>)>,
    /// Prior module state blobs.
    pub prior_chain_state: Vec<(String, Option<Vec<u8>>)>,
    /// Prior encoded BFT records touched by this block.
    pub prior_bft_records: Vec<(Address, Option<Vec<u8>>)>,
    /// Finalized height before this block was applied.
    pub prior_finalized_height: u64,
}

impl JournalEntry {
    pub fn encode(&self) -> Vec<u8> {
        sbor::basic_encode(self)
            .expect("journal encoding must succeed - this is a bug if it fails")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        sbor::basic_decode(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_types::test_utils::test_address;

    #[test]
    fn codec_round_trip() {
        let entry = JournalEntry {
            block_id: Hash::digest(b"block"),
            prior_accounts: vec![
                (test_address(1), None),
                (test_address(2), Some(vec![1, 2, 3])),
            ],
            prior_chain_state: vec![("dpos:username:alice".to_string(), None)],
            prior_bft_records: vec![(test_address(3), Some(vec![9]))],
            prior_finalized_height: 41,
        };
        assert_eq!(JournalEntry::decode(&entry.encode()), Some(entry));
    }
}
