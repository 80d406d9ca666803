//! Persisted key layout.
//!
//! ```text
//! blocks:id:<id>                  -> encoded block
//! blocks:height:<be64>            -> block id
//! accounts:<address>              -> encoded account
//! chain:tip                       -> id of the last block
//! chain:state:<key>               -> module-defined blobs
//! bft:<validator address>         -> encoded BFT record
//! bft:finalized                   -> finalized height (be64)
//! temp:<id>                       -> superseded block (bounded)
//! journal:<id>                    -> undo-journal entry for the block
//! forger:used_hashes:<address>    -> highest consumed onion index (be32)
//! ```

use forgeline_types::{Address, Hash};

pub const BLOCK_ID_PREFIX: &[u8] = b"blocks:id:";
pub const BLOCK_HEIGHT_PREFIX: &[u8] = b"blocks:height:";
pub const ACCOUNT_PREFIX: &[u8] = b"accounts:";
pub const CHAIN_TIP: &[u8] = b"chain:tip";
pub const CHAIN_STATE_PREFIX: &[u8] = b"chain:state:";
pub const BFT_PREFIX: &[u8] = b"bft:";
pub const BFT_FINALIZED: &[u8] = b"bft:finalized";
pub const TEMP_PREFIX: &[u8] = b"temp:";
pub const JOURNAL_PREFIX: &[u8] = b"journal:";
pub const FORGER_USED_HASHES_PREFIX: &[u8] = b"forger:used_hashes:";

fn concat(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

pub fn block_by_id(id: &Hash) -> Vec<u8> {
    concat(BLOCK_ID_PREFIX, id.as_bytes())
}

pub fn block_by_height(height: u64) -> Vec<u8> {
    concat(BLOCK_HEIGHT_PREFIX, &height.to_be_bytes())
}

pub fn account(address: &Address) -> Vec<u8> {
    concat(ACCOUNT_PREFIX, address.as_bytes())
}

pub fn chain_state(key: &str) -> Vec<u8> {
    concat(CHAIN_STATE_PREFIX, key.as_bytes())
}

pub fn bft_record(validator: &Address) -> Vec<u8> {
    concat(BFT_PREFIX, validator.as_bytes())
}

pub fn temp_block(id: &Hash) -> Vec<u8> {
    concat(TEMP_PREFIX, id.as_bytes())
}

pub fn journal(id: &Hash) -> Vec<u8> {
    concat(JOURNAL_PREFIX, id.as_bytes())
}

pub fn forger_used_hashes(address: &Address) -> Vec<u8> {
    concat(FORGER_USED_HASHES_PREFIX, address.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_keys_sort_numerically() {
        // Big-endian heights keep prefix iteration in height order.
        assert!(block_by_height(9) < block_by_height(10));
        assert!(block_by_height(255) < block_by_height(256));
    }

    #[test]
    fn bft_finalized_is_not_shadowed_by_a_validator_record() {
        // A validator record key is bft:<20 raw bytes>; "finalized" is 9
        // ASCII bytes, so the two can never collide.
        assert_eq!(BFT_FINALIZED.len(), BFT_PREFIX.len() + 9);
    }
}
