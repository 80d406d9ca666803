//! Transaction modules.
//!
//! The module set is fixed at boot; dispatch is a lookup in a
//! `(module_id, asset_id)` table, never runtime registration. Each module
//! contributes its account schema fields, verifies preconditions against the
//! current snapshot and applies asset semantics to it.

use crate::state_store::StateStore;
use crate::store::StorageError;
use forgeline_types::{
    Account, Address, BlockHeader, DelegateInfo, Transaction, TransactionAsset, Vote,
};
use thiserror::Error;

/// Errors from module verify/apply.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Unknown module/asset pair ({module_id}, {asset_id})")]
    UnknownAsset { module_id: u32, asset_id: u32 },

    #[error("Insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: u64, required: u64 },

    #[error("Account {0} is already a registered delegate")]
    AlreadyDelegate(Address),

    #[error("Delegate username {0:?} is already taken")]
    UsernameTaken(String),

    #[error("Vote target {0} is not a registered delegate")]
    NotADelegate(Address),

    #[error("Unvote of {requested} exceeds staked amount {staked} on {delegate}")]
    UnvoteExceedsStake {
        delegate: Address,
        staked: u64,
        requested: u64,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-transaction context handed to a module.
pub struct ApplyContext<'a> {
    pub store: &'a mut StateStore,
    pub sender: Address,
    pub transaction: &'a Transaction,
    pub block_height: u64,
}

/// Per-block context for the `after_block_apply` hook.
pub struct BlockContext<'a> {
    pub store: &'a mut StateStore,
    pub header: &'a BlockHeader,
}

/// A transaction module.
///
/// `verify` must not mutate the snapshot; `apply` may. Both run against the
/// same copy-on-write snapshot, so a failed block apply discards every
/// module effect at once.
pub trait TransactionModule: Send + Sync {
    fn id(&self) -> u32;
    fn name(&self) -> &'static str;

    /// Account fields this module contributes to the composed schema.
    fn account_schema(&self) -> &'static [&'static str];

    /// Asset ids this module handles.
    fn transaction_assets(&self) -> &'static [u32];

    /// State-dependent preconditions for one transaction.
    fn verify(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ModuleError>;

    /// Apply the asset semantics to the snapshot.
    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ModuleError>;

    /// Hook run once per block after every transaction has applied.
    fn after_block_apply(&self, _ctx: &mut BlockContext<'_>) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// The fixed module table.
pub struct ModuleRegistry {
    modules: Vec<Box<dyn TransactionModule>>,
}

impl ModuleRegistry {
    /// The built-in module set: token and dpos.
    pub fn builtin() -> Self {
        Self {
            modules: vec![Box::new(TokenModule), Box::new(DposModule)],
        }
    }

    /// Look up the handler for a `(module, asset)` pair.
    pub fn get(&self, module_id: u32, asset_id: u32) -> Option<&dyn TransactionModule> {
        self.modules
            .iter()
            .find(|m| m.id() == module_id && m.transaction_assets().contains(&asset_id))
            .map(|m| m.as_ref())
    }

    /// Whether a `(module, asset)` pair is handled at all.
    pub fn supports(&self, module_id: u32, asset_id: u32) -> bool {
        self.get(module_id, asset_id).is_some()
    }

    /// All registered modules, in registration order.
    pub fn modules(&self) -> impl Iterator<Item = &dyn TransactionModule> {
        self.modules.iter().map(|m| m.as_ref())
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|m| m.name()))
            .finish()
    }
}

fn spendable(account: &Account) -> u64 {
    account.balance
}

/// Token module: balance transfers.
pub struct TokenModule;

impl TransactionModule for TokenModule {
    fn id(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "token"
    }

    fn account_schema(&self) -> &'static [&'static str] {
        &["balance"]
    }

    fn transaction_assets(&self) -> &'static [u32] {
        &[0]
    }

    fn verify(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ModuleError> {
        let TransactionAsset::Transfer { amount, .. } = &ctx.transaction.asset else {
            let (module_id, asset_id) = (ctx.transaction.module_id, ctx.transaction.asset_id);
            return Err(ModuleError::UnknownAsset { module_id, asset_id });
        };
        let sender = ctx.store.get_account(&ctx.sender)?;
        let required = amount.saturating_add(ctx.transaction.fee);
        if spendable(&sender) < required {
            return Err(ModuleError::InsufficientBalance {
                balance: sender.balance,
                required,
            });
        }
        Ok(())
    }

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ModuleError> {
        let TransactionAsset::Transfer { recipient, amount, .. } = &ctx.transaction.asset else {
            let (module_id, asset_id) = (ctx.transaction.module_id, ctx.transaction.asset_id);
            return Err(ModuleError::UnknownAsset { module_id, asset_id });
        };
        let mut sender = ctx.store.get_account(&ctx.sender)?;
        sender.balance = sender.balance.saturating_sub(*amount);
        ctx.store.put_account(sender);

        let mut receiver = ctx.store.get_account(recipient)?;
        receiver.balance = receiver.balance.saturating_add(*amount);
        ctx.store.put_account(receiver);
        Ok(())
    }
}

/// Dpos module: delegate registration and vote casting.
pub struct DposModule;

impl DposModule {
    fn username_key(username: &str) -> String {
        format!("dpos:username:{username}")
    }
}

impl TransactionModule for DposModule {
    fn id(&self) -> u32 {
        5
    }

    fn name(&self) -> &'static str {
        "dpos"
    }

    fn account_schema(&self) -> &'static [&'static str] {
        &["delegate", "votes"]
    }

    fn transaction_assets(&self) -> &'static [u32] {
        &[0, 1]
    }

    fn verify(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ModuleError> {
        match &ctx.transaction.asset {
            TransactionAsset::RegisterDelegate { username } => {
                let sender = ctx.store.get_account(&ctx.sender)?;
                if sender.is_delegate() {
                    return Err(ModuleError::AlreadyDelegate(ctx.sender));
                }
                if spendable(&sender) < ctx.transaction.fee {
                    return Err(ModuleError::InsufficientBalance {
                        balance: sender.balance,
                        required: ctx.transaction.fee,
                    });
                }
                if ctx
                    .store
                    .get_chain_state(&Self::username_key(username))?
                    .is_some()
                {
                    return Err(ModuleError::UsernameTaken(username.clone()));
                }
                Ok(())
            }
            TransactionAsset::CastVotes { votes } => {
                let sender = ctx.store.get_account(&ctx.sender)?;
                let mut required = ctx.transaction.fee;
                for vote in votes {
                    let target = ctx.store.get_account(&vote.delegate)?;
                    if !target.is_delegate() {
                        return Err(ModuleError::NotADelegate(vote.delegate));
                    }
                    if vote.amount > 0 {
                        required = required.saturating_add(vote.amount as u64);
                    } else {
                        let requested = vote.amount.unsigned_abs();
                        let staked = sender
                            .votes
                            .iter()
                            .find(|v| v.delegate == vote.delegate)
                            .map(|v| v.amount)
                            .unwrap_or(0);
                        if requested > staked {
                            return Err(ModuleError::UnvoteExceedsStake {
                                delegate: vote.delegate,
                                staked,
                                requested,
                            });
                        }
                    }
                }
                if spendable(&sender) < required {
                    return Err(ModuleError::InsufficientBalance {
                        balance: sender.balance,
                        required,
                    });
                }
                Ok(())
            }
            _ => {
                let (module_id, asset_id) = (ctx.transaction.module_id, ctx.transaction.asset_id);
                Err(ModuleError::UnknownAsset { module_id, asset_id })
            }
        }
    }

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ModuleError> {
        match &ctx.transaction.asset {
            TransactionAsset::RegisterDelegate { username } => {
                let mut sender = ctx.store.get_account(&ctx.sender)?;
                sender.delegate = Some(DelegateInfo {
                    username: username.clone(),
                    total_votes_received: 0,
                });
                ctx.store.put_account(sender);
                ctx.store.set_chain_state(
                    &Self::username_key(username),
                    ctx.sender.as_bytes().to_vec(),
                )?;
                Ok(())
            }
            TransactionAsset::CastVotes { votes } => {
                for vote in votes {
                    let mut sender = ctx.store.get_account(&ctx.sender)?;
                    if vote.amount > 0 {
                        let amount = vote.amount as u64;
                        sender.balance = sender.balance.saturating_sub(amount);
                        match sender.votes.iter_mut().find(|v| v.delegate == vote.delegate) {
                            Some(existing) => existing.amount += amount,
                            None => sender.votes.push(Vote { delegate: vote.delegate, amount }),
                        }
                        ctx.store.put_account(sender);

                        let mut target = ctx.store.get_account(&vote.delegate)?;
                        if let Some(info) = target.delegate.as_mut() {
                            info.total_votes_received =
                                info.total_votes_received.saturating_add(amount);
                        }
                        ctx.store.put_account(target);
                    } else {
                        let amount = vote.amount.unsigned_abs();
                        sender.balance = sender.balance.saturating_add(amount);
                        if let Some(existing) =
                            sender.votes.iter_mut().find(|v| v.delegate == vote.delegate)
                        {
                            existing.amount = existing.amount.saturating_sub(amount);
                        }
                        sender.votes.retain(|v| v.amount > 0);
                        ctx.store.put_account(sender);

                        let mut target = ctx.store.get_account(&vote.delegate)?;
                        if let Some(info) = target.delegate.as_mut() {
                            info.total_votes_received =
                                info.total_votes_received.saturating_sub(amount);
                        }
                        ctx.store.put_account(target);
                    }
                }
                Ok(())
            }
            _ => {
                let (module_id, asset_id) = (ctx.transaction.module_id, ctx.transaction.asset_id);
                Err(ModuleError::UnknownAsset { module_id, asset_id })
            }
        }
    }
}
