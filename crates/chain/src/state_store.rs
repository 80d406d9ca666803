//! Copy-on-write state snapshot for one block apply.

use crate::keys;
use crate::store::{KvStore, StorageError};
use forgeline_types::{Account, Address};
use std::collections::HashMap;
use std::sync::Arc;

/// The accumulated effect of one block apply.
///
/// `updated_*` feed the commit batch; `prior_*` feed the undo journal. A
/// prior value of `None` means the key did not exist before the apply.
#[derive(Debug, Default)]
pub struct StateDiff {
    pub updated_accounts: Vec<Account>,
    pub prior_accounts: Vec<(Address, Option<Vec<u8>>)>,
    pub updated_chain_state: Vec<(String, Vec<u8>)>,
    pub prior_chain_state: Vec<(String, Option<Vec<u8>>)>,
}

/// Copy-on-write snapshot of the accounts and module state touched by one
/// block apply.
///
/// Reads fall through to the backing store on first touch; the prior encoded
/// value is captured at that moment so the undo journal can restore it
/// byte-exactly. Nothing is persisted until the processor commits the diff
/// in the block batch.
pub struct StateStore {
    base: Arc<dyn KvStore>,
    accounts: HashMap<Address, Account>,
    prior_accounts: HashMap<Address, Option<Vec<u8>>>,
    /// Touch order, so the diff (and therefore the commit batch) is
    /// deterministic across nodes.
    account_order: Vec<Address>,
    chain_state: HashMap<String, Vec<u8>>,
    prior_chain_state: HashMap<String, Option<Vec<u8>>>,
    chain_state_order: Vec<String>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("accounts", &self.accounts)
            .field("prior_accounts", &self.prior_accounts)
            .field("account_order", &self.account_order)
            .field("chain_state", &self.chain_state)
            .field("prior_chain_state", &self.prior_chain_state)
            .field("chain_state_order", &self.chain_state_order)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open a fresh snapshot over the backing store.
    pub fn new(base: Arc<dyn KvStore>) -> Self {
        Self {
            base,
            accounts: HashMap::new(),
            prior_accounts: HashMap::new(),
            account_order: Vec::new(),
            chain_state: HashMap::new(),
            prior_chain_state: HashMap::new(),
            chain_state_order: Vec::new(),
        }
    }

    /// Get the account at `address`, defaulting to a fresh account if it has
    /// never been written.
    pub fn get_account(&mut self, address: &Address) -> Result<Account, StorageError> {
        if let Some(account) = self.accounts.get(address) {
            return Ok(account.clone());
        }
        let raw = self.base.get(&keys::account(address))?;
        let account = match &raw {
            Some(bytes) => {
                sbor::basic_decode::<Account>(bytes).map_err(|e| StorageError::Corrupted {
                    key: format!("accounts:{address}"),
                    reason: format!("{e:?}"),
                })?
            }
            None => Account::new(*address),
        };
        self.prior_accounts.insert(*address, raw);
        self.account_order.push(*address);
        self.accounts.insert(*address, account.clone());
        Ok(account)
    }

    /// Write back a mutated account. The account must have been read through
    /// this snapshot first.
    pub fn put_account(&mut self, account: Account) {
        debug_assert!(
            self.accounts.contains_key(&account.address),
            "account written without a prior read through the snapshot"
        );
        self.accounts.insert(account.address, account);
    }

    /// Read a module-defined chain state blob.
    pub fn get_chain_state(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = self.chain_state.get(key) {
            return Ok(Some(value.clone()));
        }
        if let Some(prior) = self.prior_chain_state.get(key) {
            // Touched but never written in this snapshot.
            return Ok(prior.clone());
        }
        let raw = self.base.get(&keys::chain_state(key))?;
        self.prior_chain_state.insert(key.to_string(), raw.clone());
        self.chain_state_order.push(key.to_string());
        Ok(raw)
    }

    /// Write a module-defined chain state blob.
    pub fn set_chain_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if !self.prior_chain_state.contains_key(key) {
            let raw = self.base.get(&keys::chain_state(key))?;
            self.prior_chain_state.insert(key.to_string(), raw);
            self.chain_state_order.push(key.to_string());
        }
        self.chain_state.insert(key.to_string(), value);
        Ok(())
    }

    /// Close the snapshot, producing the diff for commit and journal.
    pub fn into_diff(self) -> StateDiff {
        let mut diff = StateDiff::default();
        for address in &self.account_order {
            diff.updated_accounts.push(self.accounts[address].clone());
            diff.prior_accounts
                .push((*address, self.prior_accounts[address].clone()));
        }
        for key in &self.chain_state_order {
            if let Some(value) = self.chain_state.get(key) {
                diff.updated_chain_state.push((key.clone(), value.clone()));
            }
            diff.prior_chain_state
                .push((key.clone(), self.prior_chain_state[key].clone()));
        }
        diff
    }
}
