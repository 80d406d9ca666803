//! End-to-end tests for the production runner: real tokio timers, RocksDB
//! storage and a loopback peer network. All tests use `#[serial]` to avoid
//! state leakage through the process-global metrics registry.

use forgeline_core::ChainEvent;
use forgeline_forger::{DelegateConfig, EncryptedPassphrase, HashOnion};
use forgeline_node::{create_genesis_block, NodeConfig, NodeStateMachine};
use forgeline_production::{
    InboundMessage, NodeRunner, PeerNetwork, PeerRequest, RocksDbStore,
};
use forgeline_types::test_utils::{test_address, test_transfer};
use forgeline_types::{Account, DelegateInfo, PeerId};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const DELEGATE_SEEDS: [u8; 3] = [1, 2, 3];
const PASSWORD: &str = "e2e password";

/// Loopback network: records outbound traffic, connects to nobody.
#[derive(Default)]
struct LoopbackNetwork {
    broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl PeerNetwork for LoopbackNetwork {
    fn broadcast(&self, bytes: Vec<u8>) {
        self.broadcasts.lock().push(bytes);
    }
    fn send_request(&self, _peer: PeerId, _request: PeerRequest) {}
    fn request_tips(&self) {}
    fn respond(&self, _request_id: u64, _bytes: Vec<u8>) {}
    fn penalize(&self, _peer: PeerId, _points: u32) {}
    fn connected_peers(&self) -> Vec<PeerId> {
        Vec::new()
    }
}

fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

fn e2e_config(genesis_timestamp: u32) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.genesis.timestamp = genesis_timestamp;
    config.genesis.block_time = 1;
    config.genesis.round_length = 3;
    config.genesis.bft_threshold = 100;
    config.genesis.min_fee_per_byte = 0;
    config.genesis.base_fees = Vec::new();
    config.genesis.rewards.milestones = Vec::new();
    config.forging.wait_threshold = 0;
    config.forging.force = true;
    config.forging.forge_interval_ms = 50;
    config.forging.default_password = Some(PASSWORD.to_string());
    config.forging.delegates = DELEGATE_SEEDS
        .iter()
        .map(|seed| DelegateConfig {
            address: test_address(*seed),
            encrypted_passphrase: EncryptedPassphrase::encrypt(
                &format!("test passphrase {seed}"),
                PASSWORD,
            ),
            hash_onion: HashOnion::generate_from_seed([*seed; 16], 10_000, 1_000)
                .config()
                .clone(),
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

struct Fixture {
    runner: NodeRunner,
    handle: forgeline_production::NodeHandle,
    shutdown: forgeline_production::ShutdownHandle,
    _inbound_tx: mpsc::Sender<InboundMessage>,
}

fn build_fixture(dir: &TempDir, genesis_timestamp: u32) -> Fixture {
    let store = Arc::new(RocksDbStore::open(dir.path().join("db")).unwrap());
    let (node, boot_actions) = NodeStateMachine::new(
        e2e_config(genesis_timestamp),
        store,
        &create_genesis_block(genesis_timestamp),
        &genesis_accounts(),
    )
    .unwrap();

    let network = Arc::new(LoopbackNetwork::default());
    let (inbound_tx, inbound_rx) = mpsc::channel(1_024);
    let (runner, handle, shutdown) =
        NodeRunner::new(node, boot_actions, network, inbound_rx, "2.0".to_string());
    Fixture { runner, handle, shutdown, _inbound_tx: inbound_tx }
}

#[tokio::test]
#[serial]
async fn node_forges_blocks_end_to_end() {
    let dir = TempDir::new().unwrap();
    // Genesis a little in the past so the first slots are already open.
    let fixture = build_fixture(&dir, now_unix() - 5);
    let mut events = fixture.handle.subscribe();
    let handle = fixture.handle.clone();

    let runner_task = tokio::spawn(fixture.runner.run());

    // Two blocks within a handful of one-second slots.
    let mut seen_heights = Vec::new();
    let deadline = Duration::from_secs(10);
    while seen_heights.len() < 2 {
        let event = timeout(deadline, events.recv())
            .await
            .expect("no block within the deadline")
            .expect("event bus closed");
        if let ChainEvent::NewBlock { block } = event {
            seen_heights.push(block.height());
        }
    }
    assert_eq!(seen_heights[0], 1);
    assert_eq!(seen_heights[1], 2);

    let info = handle.get_node_info();
    assert!(info.height >= 2);
    assert!(!info.syncing);
    assert_eq!(handle.get_validators().len(), 3);

    fixture.shutdown.shutdown();
    timeout(Duration::from_secs(5), runner_task)
        .await
        .expect("runner did not stop")
        .unwrap();
}

#[tokio::test]
#[serial]
async fn posted_transaction_is_included_in_a_block() {
    let dir = TempDir::new().unwrap();
    let fixture = build_fixture(&dir, now_unix() - 5);
    let mut events = fixture.handle.subscribe();
    let handle = fixture.handle.clone();
    let runner_task = tokio::spawn(fixture.runner.run());

    let tx = test_transfer(9, 8, 0, 1_000);
    let tx_id = tx.id();
    handle.post_transaction(tx).await.unwrap();

    let deadline = Duration::from_secs(10);
    let mut included = false;
    while !included {
        let event = timeout(deadline, events.recv())
            .await
            .expect("transaction was never included")
            .expect("event bus closed");
        if let ChainEvent::NewBlock { block } = event {
            included = block.payload.iter().any(|tx| tx.id() == tx_id);
        }
    }

    // The sender balance moved on chain.
    let account = handle.get_account(&test_address(9)).unwrap().unwrap();
    assert_eq!(account.nonce, 1);

    fixture.shutdown.shutdown();
    timeout(Duration::from_secs(5), runner_task)
        .await
        .expect("runner did not stop")
        .unwrap();
}

#[tokio::test]
#[serial]
async fn chain_state_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let genesis_timestamp = now_unix() - 5;

    let reached_height = {
        let fixture = build_fixture(&dir, genesis_timestamp);
        let mut events = fixture.handle.subscribe();
        let handle = fixture.handle.clone();
        let runner_task = tokio::spawn(fixture.runner.run());

        // Wait for at least one applied block.
        loop {
            let event = timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("no block before restart")
                .expect("event bus closed");
            if matches!(event, ChainEvent::NewBlock { .. }) {
                break;
            }
        }
        let height = handle.get_node_info().height;
        fixture.shutdown.shutdown();
        timeout(Duration::from_secs(5), runner_task)
            .await
            .expect("runner did not stop")
            .unwrap();
        height
    };

    // Reopen the same database: the tip is where we left it.
    let store = Arc::new(RocksDbStore::open(dir.path().join("db")).unwrap());
    let (node, _) = NodeStateMachine::new(
        e2e_config(genesis_timestamp),
        store,
        &create_genesis_block(genesis_timestamp),
        &genesis_accounts(),
    )
    .unwrap();
    assert!(node.processor().chain().last_block().height() >= reached_height);
}

#[tokio::test]
#[serial]
async fn operator_surface_serves_blocks_and_info() {
    let dir = TempDir::new().unwrap();
    let fixture = build_fixture(&dir, now_unix() - 5);
    let mut events = fixture.handle.subscribe();
    let handle = fixture.handle.clone();
    let runner_task = tokio::spawn(fixture.runner.run());

    loop {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("no block forged")
            .expect("event bus closed");
        if matches!(event, ChainEvent::NewBlock { .. }) {
            break;
        }
    }

    let genesis = handle.get_block_by_height(0).unwrap().unwrap();
    assert_eq!(genesis.height(), 0);
    let last = handle.get_last_block().unwrap().unwrap();
    assert!(last.height() >= 1);

    // Ids round-trip through the base64 operator encoding.
    let info = handle.get_node_info();
    let by_id = handle.get_block_by_id(&info.last_block_id).unwrap();
    assert!(by_id.is_some());

    let range = handle.get_blocks_by_height_range(0, last.height()).unwrap();
    assert!(range.len() as u64 >= 2);

    fixture.shutdown.shutdown();
    timeout(Duration::from_secs(5), runner_task)
        .await
        .expect("runner did not stop")
        .unwrap();
}
