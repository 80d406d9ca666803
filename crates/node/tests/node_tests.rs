//! End-to-end node tests over an in-memory store, driving the composed
//! state machine the way the runner does: one event at a time, internal
//! follow-ups drained before the next input.

use forgeline_chain::MemoryStore;
use forgeline_core::{Action, ChainEvent, Event, StateMachine, TimerId};
use forgeline_forger::{DelegateConfig, EncryptedPassphrase, HashOnion};
use forgeline_node::{create_genesis_block, NodeConfig, NodeError, NodeStateMachine};
use forgeline_types::test_utils::{test_address, test_transfer};
use forgeline_types::{Account, DelegateInfo, PeerId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const DELEGATE_SEEDS: [u8; 3] = [1, 2, 3];
const PASSWORD: &str = "node password";

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.genesis.timestamp = 0;
    config.genesis.block_time = 10;
    config.genesis.round_length = 3;
    config.genesis.bft_threshold = 100;
    config.genesis.min_fee_per_byte = 0;
    config.genesis.base_fees = Vec::new();
    config.genesis.rewards.milestones = Vec::new();
    config.forging.force = true;
    config.forging.default_password = Some(PASSWORD.to_string());
    config.forging.delegates = DELEGATE_SEEDS
        .iter()
        .map(|seed| DelegateConfig {
            address: test_address(*seed),
            encrypted_passphrase: EncryptedPassphrase::encrypt(
                &format!("test passphrase {seed}"),
                PASSWORD,
            ),
            hash_onion: HashOnion::generate_from_seed([*seed; 16], 1_000, 100).config().clone(),
        })
        .collect();
    config
}

fn genesis_accounts() -> Vec<Account> {
    let mut accounts: Vec<Account> = DELEGATE_SEEDS
        .iter()
        .map(|seed| {
            let mut account = Account::new(test_address(*seed));
            account.delegate = Some(DelegateInfo {
                username: format!("genesis_{seed}"),
                total_votes_received: 1_000_000 - *seed as u64,
            });
            account
        })
        .collect();
    let mut funded = Account::new(test_address(9));
    funded.balance = 1_000_000_000;
    accounts.push(funded);
    accounts
}

fn build_node(store: Arc<MemoryStore>) -> (NodeStateMachine, Vec<Action>) {
    NodeStateMachine::new(
        test_config(),
        store,
        &create_genesis_block(0),
        &genesis_accounts(),
    )
    .unwrap()
}

/// Deliver one event and drain the internal follow-ups, the way the runner
/// does. Returns the non-internal actions in emission order.
fn drive(node: &mut NodeStateMachine, now_secs: u64, event: Event) -> Vec<Action> {
    node.set_time(Duration::from_secs(now_secs));
    let mut queue = VecDeque::from([event]);
    let mut out = Vec::new();
    while let Some(event) = queue.pop_front() {
        for action in node.handle(event) {
            match action {
                Action::EnqueueInternal { event } => queue.push_back(event),
                other => out.push(other),
            }
        }
    }
    out
}

fn new_block_heights(actions: &[Action]) -> Vec<u64> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Emit { event: ChainEvent::NewBlock { block } } => Some(block.height()),
            _ => None,
        })
        .collect()
}

#[test]
fn boot_arms_the_timers() {
    let (_, actions) = build_node(MemoryStore::shared());
    let timer_ids: Vec<TimerId> = actions
        .iter()
        .filter_map(|a| match a {
            Action::SetTimer { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    assert!(timer_ids.contains(&TimerId::Forge));
    assert!(timer_ids.contains(&TimerId::PoolSweep));
}

#[test]
fn forge_ticks_build_the_chain() {
    let (mut node, _) = build_node(MemoryStore::shared());

    let mut heights = Vec::new();
    for t in [10u64, 20, 30] {
        let actions = drive(&mut node, t, Event::ForgeTick);
        heights.extend(new_block_heights(&actions));
        // Each tick re-arms the forge timer.
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Forge, .. })));
    }

    assert_eq!(heights, vec![1, 2, 3]);
    assert_eq!(node.processor().chain().last_block().height(), 3);
    assert_eq!(node.processor().chain().finalized_height(), 0);
    assert!(node.pool().is_empty());
}

#[test]
fn forged_blocks_carry_pooled_transactions() {
    let (mut node, _) = build_node(MemoryStore::shared());

    let tx = test_transfer(9, 8, 0, 1_000);
    let actions = drive(
        &mut node,
        5,
        Event::TransactionReceived { transaction: Box::new(tx.clone()), from: None },
    );
    // Admission announces the id to peers.
    assert!(actions.iter().any(|a| matches!(a, Action::Broadcast { .. })));
    assert_eq!(node.pool().len(), 1);

    let actions = drive(&mut node, 10, Event::ForgeTick);
    assert_eq!(new_block_heights(&actions), vec![1]);
    let block = node.processor().chain().last_block();
    assert_eq!(block.payload.len(), 1);
    assert_eq!(block.payload[0].id(), tx.id());

    // Inclusion evicted it from the pool, with the matching notification.
    assert!(node.pool().is_empty());
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::Emit { event: ChainEvent::TransactionRemoved { .. } }
    )));
}

#[test]
fn duplicate_submission_is_silent() {
    let (mut node, _) = build_node(MemoryStore::shared());
    let tx = test_transfer(9, 8, 0, 1_000);
    drive(
        &mut node,
        5,
        Event::TransactionReceived { transaction: Box::new(tx.clone()), from: None },
    );
    let actions = drive(
        &mut node,
        6,
        Event::TransactionReceived { transaction: Box::new(tx), from: None },
    );
    assert!(actions.is_empty());
    assert_eq!(node.pool().len(), 1);
}

#[test]
fn invalid_peer_transaction_is_penalized() {
    let (mut node, _) = build_node(MemoryStore::shared());
    let mut tx = test_transfer(9, 8, 0, 1_000);
    tx.fee += 1; // breaks the signature
    let actions = drive(
        &mut node,
        5,
        Event::TransactionReceived { transaction: Box::new(tx), from: Some(PeerId(4)) },
    );
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::PenalizePeer { peer: PeerId(4), points: 100 })));
}

#[test]
fn announcements_fetch_only_unknown_ids() {
    let (mut node, _) = build_node(MemoryStore::shared());
    let known = test_transfer(9, 8, 0, 1_000);
    drive(
        &mut node,
        5,
        Event::TransactionReceived { transaction: Box::new(known.clone()), from: None },
    );

    let unknown_id = test_transfer(9, 8, 1, 1_000).id();
    let actions = drive(
        &mut node,
        6,
        Event::TransactionsAnnounced { ids: vec![known.id(), unknown_id], from: PeerId(2) },
    );
    match actions.as_slice() {
        [Action::RequestTransactions { from: PeerId(2), ids }] => {
            assert_eq!(ids, &vec![unknown_id]);
        }
        other => panic!("expected a fetch of the unknown id, got {other:?}"),
    }
}

#[test]
fn forge_tick_is_a_noop_while_syncing() {
    let (mut node, _) = build_node(MemoryStore::shared());
    drive(&mut node, 10, Event::ForgeTick);
    assert_eq!(node.processor().chain().last_block().height(), 1);

    // A far-ahead peer block triggers sync; the node starts selecting a
    // reference peer and holds the exclusive guard.
    let mut far = node.processor().chain().last_block().clone();
    far.header.height = 80;
    let actions = drive(
        &mut node,
        20,
        Event::BlockReceived { block: Box::new(far), from: PeerId(8) },
    );
    assert!(actions.iter().any(|a| matches!(a, Action::RequestNetworkTips)));
    assert!(node.is_syncing());

    // Inside the local delegate's slot, the tick must be a no-op.
    let actions = drive(&mut node, 20, Event::ForgeTick);
    assert_eq!(node.processor().chain().last_block().height(), 1);
    assert!(new_block_heights(&actions).is_empty());

    // Inbound blocks are dropped while the synchronizer is active.
    let mut next = node.processor().chain().last_block().clone();
    next.header.height = 2;
    let actions = drive(
        &mut node,
        20,
        Event::BlockReceived { block: Box::new(next), from: PeerId(9) },
    );
    assert!(actions.is_empty());
}

#[test]
fn restart_resumes_from_the_stored_tip() {
    let store = MemoryStore::shared();
    {
        let (mut node, _) = build_node(store.clone());
        drive(&mut node, 10, Event::ForgeTick);
        drive(&mut node, 20, Event::ForgeTick);
        assert_eq!(node.processor().chain().last_block().height(), 2);
    }

    let (node, _) = build_node(store);
    assert_eq!(node.processor().chain().last_block().height(), 2);
}

#[test]
fn restart_rejects_a_different_genesis() {
    let store = MemoryStore::shared();
    let (_node, _) = build_node(store.clone());

    let result = NodeStateMachine::new(
        test_config(),
        store,
        &create_genesis_block(999),
        &genesis_accounts(),
    );
    assert!(matches!(
        result,
        Err(NodeError::Chain(forgeline_chain::ChainError::GenesisMismatch { .. }))
    ));
}

#[test]
fn forging_status_event_toggles_the_delegate() {
    let mut config = test_config();
    config.forging.default_password = None;
    let (mut node, _) = NodeStateMachine::new(
        config,
        MemoryStore::shared(),
        &create_genesis_block(0),
        &genesis_accounts(),
    )
    .unwrap();

    let address = test_address(1);
    assert!(!node.forger().is_forging(&address));
    drive(
        &mut node,
        1,
        Event::UpdateForgingStatus {
            address,
            password: PASSWORD.to_string(),
            enabled: true,
        },
    );
    assert!(node.forger().is_forging(&address));
    drive(
        &mut node,
        2,
        Event::UpdateForgingStatus {
            address,
            password: PASSWORD.to_string(),
            enabled: false,
        },
    );
    assert!(!node.forger().is_forging(&address));
}

#[test]
fn pool_sweep_rearms_and_expires() {
    let (mut node, _) = build_node(MemoryStore::shared());
    let tx = test_transfer(9, 8, 0, 1_000);
    drive(
        &mut node,
        5,
        Event::TransactionReceived { transaction: Box::new(tx.clone()), from: None },
    );

    // Hours later the sweep evicts the stale transaction.
    let actions = drive(&mut node, 5 + 4 * 60 * 60, Event::PoolSweepTimer);
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::SetTimer { id: TimerId::PoolSweep, .. })));
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::Emit {
            event: ChainEvent::TransactionRemoved { reason: forgeline_core::RemovalReason::Expired, .. }
        }
    )));
    assert!(node.pool().is_empty());
}
