//! Synchronizer tests: block-sync catch-up, fast chain switching, and the
//! abort/restore paths, all driven against in-memory processors.

use forgeline_bft::{BftConfig, FinalityManager};
use forgeline_chain::{Chain, ChainConfig, FeePolicy, MemoryStore, ModuleRegistry, RewardSchedule};
use forgeline_core::Action;
use forgeline_messages::PeerTip;
use forgeline_processor::{BlockProcessor, Origin, ProcessorConfig};
use forgeline_sync::{SyncConfig, Synchronizer};
use forgeline_types::test_utils::{test_address, test_keypair};
use forgeline_types::{
    merkle_root, Account, Address, Block, BlockAsset, BlockHeader, DelegateInfo, Hash, KeyPair,
    PeerId, Signature, Slots,
};
use std::collections::HashMap;

const BLOCK_TIME: u32 = 10;
const ROUND_LENGTH: u32 = 3;
const DELEGATE_SEEDS: [u8; 3] = [1, 2, 3];
const CHUNK: usize = forgeline_messages::BLOCKS_PER_CHUNK;

struct Node {
    processor: BlockProcessor,
    keypairs: HashMap<Address, KeyPair>,
}

fn genesis_block() -> Block {
    let kp = test_keypair(0);
    let mut header = BlockHeader {
        version: 2,
        height: 0,
        timestamp: 0,
        previous_block_id: Hash::ZERO,
        generator_public_key: kp.public_key(),
        transaction_root: merkle_root(&[]),
        asset: BlockAsset::genesis(),
        signature: Signature::zero(),
    };
    header.sign(&kp);
    Block { header, payload: Vec::new() }
}

fn genesis_accounts() -> Vec<Account> {
    DELEGATE_SEEDS
        .iter()
        .map(|seed| {
            let mut account = Account::new(test_address(*seed));
            account.delegate = Some(DelegateInfo {
                username: format!("genesis_{seed}"),
                total_votes_received: 1_000_000 - *seed as u64,
            });
            account
        })
        .collect()
}

fn node(finality_offset: u64) -> Node {
    let store = MemoryStore::shared();
    let genesis = genesis_block();
    let (chain, _) = Chain::init(
        store,
        ChainConfig { round_length: ROUND_LENGTH, max_temp_blocks: 500 },
        &genesis,
        &genesis_accounts(),
    )
    .unwrap();
    let processor = BlockProcessor::new(
        chain,
        FinalityManager::new(BftConfig { finality_offset }),
        ModuleRegistry::builtin(),
        FeePolicy::new(0, Vec::new()),
        RewardSchedule::default(),
        Slots::new(0, BLOCK_TIME, ROUND_LENGTH),
        ProcessorConfig::default(),
    );
    let keypairs = DELEGATE_SEEDS
        .iter()
        .map(|seed| (test_address(*seed), test_keypair(*seed)))
        .collect();
    Node { processor, keypairs }
}

impl Node {
    /// Forge and apply the next block. `salt` perturbs the seed reveal so
    /// two nodes can deterministically diverge from the same height.
    fn forge(&mut self, salt: u8) -> Block {
        let last = self.processor.chain().last_block();
        let height = last.height() + 1;
        let slot = height;
        let generator = self
            .processor
            .chain()
            .active_validators()
            .generator_at(slot)
            .unwrap();
        let keypair = &self.keypairs[&generator];
        let (previously_forged, max_height_prevoted) = self.processor.forging_info(&generator);

        let mut reveal = [height as u8; 16];
        reveal[0] ^= salt;
        let mut header = BlockHeader {
            version: 2,
            height,
            timestamp: height as u32 * BLOCK_TIME,
            previous_block_id: last.id(),
            generator_public_key: keypair.public_key(),
            transaction_root: merkle_root(&[]),
            asset: BlockAsset {
                max_height_previously_forged: previously_forged,
                max_height_prevoted,
                seed_reveal: reveal,
            },
            signature: Signature::zero(),
        };
        header.sign(keypair);
        let block = Block { header, payload: Vec::new() };
        let actions = self.processor.process(block.clone(), Origin::Local);
        assert!(!actions.is_empty(), "forged block must apply");
        block
    }

    fn forge_to(&mut self, height: u64, salt: u8) {
        while self.processor.chain().last_block().height() < height {
            self.forge(salt);
        }
    }

    fn height(&self) -> u64 {
        self.processor.chain().last_block().height()
    }
}

fn requested_block_id(actions: &[Action]) -> Option<Hash> {
    actions.iter().find_map(|a| match a {
        Action::RequestBlocksFromId { block_id, .. } => Some(*block_id),
        _ => None,
    })
}

fn has_penalty(actions: &[Action], points: u32) -> bool {
    actions
        .iter()
        .any(|a| matches!(a, Action::PenalizePeer { points: p, .. } if *p == points))
}

fn sync_config() -> SyncConfig {
    SyncConfig { min_tip_agreement: 3, max_retries: 3, round_length: ROUND_LENGTH as u64 }
}

/// Catch-up: local at 100 with finalized 90, peer at 200 with the common
/// block at 95. The synchronizer reverts to 95 and applies 105 blocks in
/// chunks of 34, never touching anything at or below the finalized height.
#[test]
fn block_sync_catches_up_to_the_reference_peer() {
    let mut local = node(10);
    let mut remote = node(10);
    local.forge_to(95, 0);
    remote.forge_to(95, 0);
    assert_eq!(
        local.processor.chain().last_block().id(),
        remote.processor.chain().last_block().id()
    );
    local.forge_to(100, 0);
    remote.forge_to(200, 1);
    assert_eq!(local.processor.chain().finalized_height(), 90);

    let common_id = local
        .processor
        .chain()
        .data_access()
        .get_block_by_height(95)
        .unwrap()
        .unwrap()
        .id();
    let block_90_id = local
        .processor
        .chain()
        .data_access()
        .get_block_by_height(90)
        .unwrap()
        .unwrap()
        .id();

    let mut sync = Synchronizer::new(sync_config());
    let peer = PeerId(1);
    let trigger = remote.processor.chain().last_block().clone();

    // Trigger: far ahead of the local tip.
    let actions = sync.on_sync_required(trigger.clone(), peer, &mut local.processor);
    assert!(sync.is_active());
    assert!(actions.iter().any(|a| matches!(a, Action::RequestNetworkTips)));

    // Three peers agree on the remote tip; one outlier does not count.
    let tips = vec![
        PeerTip { peer: PeerId(1), height: 200, max_height_prevoted: 190, tip_id: trigger.id() },
        PeerTip { peer: PeerId(2), height: 200, max_height_prevoted: 190, tip_id: trigger.id() },
        PeerTip { peer: PeerId(3), height: 200, max_height_prevoted: 189, tip_id: trigger.id() },
        PeerTip {
            peer: PeerId(4),
            height: 150,
            max_height_prevoted: 149,
            tip_id: Hash::digest(b"outlier"),
        },
    ];
    let actions = sync.on_network_tips(tips, &mut local.processor);
    let reference = match actions.as_slice() {
        [Action::RequestHighestCommonBlock { from, ids }] => {
            assert!(!ids.is_empty());
            *from
        }
        other => panic!("expected a common-block probe, got {other:?}"),
    };
    assert_eq!(reference, PeerId(1));

    // The probe answer reverts the local chain to the common block.
    let actions = sync.on_highest_common_block(reference, Some(common_id), &mut local.processor);
    assert_eq!(local.height(), 95);
    assert_eq!(requested_block_id(&actions), Some(common_id));

    // Serve chunks of 34 until the remote tip is reached.
    let remote_data = remote.processor.chain().data_access();
    let mut served = 0u64;
    loop {
        let from = local.height() + 1;
        let blocks = remote_data
            .get_blocks_by_height_range(from, (from + CHUNK as u64 - 1).min(200))
            .unwrap();
        assert!(blocks.len() <= CHUNK);
        served += blocks.len() as u64;
        let actions = sync.on_sync_blocks(reference, blocks, &mut local.processor);
        if !sync.is_active() {
            assert!(requested_block_id(&actions).is_none());
            break;
        }
        // The next chunk is requested from the new tip.
        assert_eq!(
            requested_block_id(&actions),
            Some(local.processor.chain().last_block().id())
        );
    }

    assert_eq!(served, 105);
    assert_eq!(local.height(), 200);
    assert_eq!(
        local.processor.chain().last_block().id(),
        remote.processor.chain().last_block().id()
    );
    // Finalized history was never rewritten.
    assert_eq!(
        local
            .processor
            .chain()
            .data_access()
            .get_block_by_height(90)
            .unwrap()
            .unwrap()
            .id(),
        block_90_id
    );
    assert!(local.processor.chain().temp_blocks().unwrap().is_empty());
}

#[test]
fn block_sync_aborts_without_tip_agreement() {
    let mut local = node(10);
    let mut remote = node(10);
    local.forge_to(10, 0);
    remote.forge_to(50, 1);

    let mut sync = Synchronizer::new(sync_config());
    let trigger = remote.processor.chain().last_block().clone();
    sync.on_sync_required(trigger.clone(), PeerId(1), &mut local.processor);

    // Only two peers agree: below the quorum of three.
    let tips = vec![
        PeerTip { peer: PeerId(1), height: 50, max_height_prevoted: 40, tip_id: trigger.id() },
        PeerTip { peer: PeerId(2), height: 50, max_height_prevoted: 40, tip_id: trigger.id() },
    ];
    sync.on_network_tips(tips, &mut local.processor);
    assert!(!sync.is_active());
    assert_eq!(local.height(), 10);
}

#[test]
fn common_block_below_finalized_is_an_irrecoverable_fork() {
    let mut local = node(10);
    let mut remote = node(10);
    local.forge_to(85, 0);
    remote.forge_to(85, 0);
    local.forge_to(100, 0);
    remote.forge_to(200, 1);
    assert_eq!(local.processor.chain().finalized_height(), 90);

    let below_finalized = local
        .processor
        .chain()
        .data_access()
        .get_block_by_height(85)
        .unwrap()
        .unwrap()
        .id();

    let mut sync = Synchronizer::new(sync_config());
    let peer = PeerId(7);
    let trigger = remote.processor.chain().last_block().clone();
    sync.on_sync_required(trigger.clone(), peer, &mut local.processor);
    sync.on_network_tips(
        (1..=3)
            .map(|n| PeerTip {
                peer: PeerId(n),
                height: 200,
                max_height_prevoted: 190,
                tip_id: trigger.id(),
            })
            .collect(),
        &mut local.processor,
    );

    let actions = sync.on_highest_common_block(PeerId(1), Some(below_finalized), &mut local.processor);
    assert!(has_penalty(&actions, 100));
    assert!(!sync.is_active());
    // The chain was never touched.
    assert_eq!(local.height(), 100);
}

#[test]
fn fast_chain_switch_performs_a_small_reorganization() {
    let mut local = node(100);
    let mut remote = node(100);
    local.forge_to(3, 0);
    remote.forge_to(3, 0);
    local.forge_to(5, 0);
    remote.forge_to(6, 1);

    let common_id = local
        .processor
        .chain()
        .data_access()
        .get_block_by_height(3)
        .unwrap()
        .unwrap()
        .id();

    let mut sync = Synchronizer::new(sync_config());
    let peer = PeerId(9);
    let trigger = remote.processor.chain().last_block().clone();

    // Within two rounds of the tip: fast chain switching applies.
    let actions = sync.on_sync_required(trigger, peer, &mut local.processor);
    assert!(sync.is_active());
    assert!(matches!(
        actions.as_slice(),
        [Action::RequestHighestCommonBlock { .. }]
    ));

    let actions = sync.on_highest_common_block(peer, Some(common_id), &mut local.processor);
    assert_eq!(local.height(), 3);
    assert_eq!(requested_block_id(&actions), Some(common_id));
    // The abandoned branch is parked in the temp region.
    assert_eq!(local.processor.chain().temp_blocks().unwrap().len(), 2);

    let blocks = remote
        .processor
        .chain()
        .data_access()
        .get_blocks_by_height_range(4, 6)
        .unwrap();
    sync.on_sync_blocks(peer, blocks, &mut local.processor);
    assert!(!sync.is_active());
    assert_eq!(local.height(), 6);
    assert_eq!(
        local.processor.chain().last_block().id(),
        remote.processor.chain().last_block().id()
    );
}

#[test]
fn failed_switch_restores_the_original_chain() {
    let mut local = node(100);
    let mut remote = node(100);
    local.forge_to(3, 0);
    remote.forge_to(3, 0);
    local.forge_to(5, 0);
    remote.forge_to(6, 1);
    let original_tip = local.processor.chain().last_block().id();

    let common_id = local
        .processor
        .chain()
        .data_access()
        .get_block_by_height(3)
        .unwrap()
        .unwrap()
        .id();

    let mut sync = Synchronizer::new(sync_config());
    let peer = PeerId(9);
    let trigger = remote.processor.chain().last_block().clone();
    sync.on_sync_required(trigger, peer, &mut local.processor);
    sync.on_highest_common_block(peer, Some(common_id), &mut local.processor);
    assert_eq!(local.height(), 3);

    // A chunk that skips height 4 breaks linkage and poisons the switch.
    let bad_chunk = remote
        .processor
        .chain()
        .data_access()
        .get_blocks_by_height_range(5, 6)
        .unwrap();
    let actions = sync.on_sync_blocks(peer, bad_chunk, &mut local.processor);

    assert!(has_penalty(&actions, 100));
    assert!(!sync.is_active());
    assert_eq!(local.height(), 5);
    assert_eq!(local.processor.chain().last_block().id(), original_tip);
}

#[test]
fn exhausted_retries_abort_and_restore() {
    let mut local = node(100);
    let mut remote = node(100);
    local.forge_to(3, 0);
    remote.forge_to(3, 0);
    local.forge_to(5, 0);
    remote.forge_to(6, 1);
    let original_tip = local.processor.chain().last_block().id();

    let common_id = local
        .processor
        .chain()
        .data_access()
        .get_block_by_height(3)
        .unwrap()
        .unwrap()
        .id();

    let mut sync = Synchronizer::new(sync_config());
    let peer = PeerId(2);
    let trigger = remote.processor.chain().last_block().clone();
    sync.on_sync_required(trigger, peer, &mut local.processor);
    sync.on_highest_common_block(peer, Some(common_id), &mut local.processor);

    // Two failures retry with the same request.
    for _ in 0..2 {
        let actions = sync.on_request_failed(peer, "timeout", &mut local.processor);
        assert!(sync.is_active());
        assert!(requested_block_id(&actions).is_some());
    }
    // The third exhausts the bound: abort, restore, penalize.
    let actions = sync.on_request_failed(peer, "timeout", &mut local.processor);
    assert!(!sync.is_active());
    assert!(has_penalty(&actions, 100));
    assert_eq!(local.processor.chain().last_block().id(), original_tip);
}

#[test]
fn events_from_other_peers_are_ignored_while_active() {
    let mut local = node(100);
    let mut remote = node(100);
    local.forge_to(5, 0);
    remote.forge_to(6, 1);

    let mut sync = Synchronizer::new(sync_config());
    let peer = PeerId(3);
    let trigger = remote.processor.chain().last_block().clone();
    sync.on_sync_required(trigger, peer, &mut local.processor);

    let actions =
        sync.on_highest_common_block(PeerId(99), Some(Hash::digest(b"x")), &mut local.processor);
    assert!(actions.is_empty());
    assert!(sync.is_active());
}

#[test]
fn cancel_clears_the_active_mechanism() {
    let mut local = node(100);
    let mut remote = node(100);
    local.forge_to(5, 0);
    remote.forge_to(6, 1);

    let mut sync = Synchronizer::new(sync_config());
    let trigger = remote.processor.chain().last_block().clone();
    sync.on_sync_required(trigger, PeerId(1), &mut local.processor);
    assert!(sync.is_active());
    sync.cancel();
    assert!(!sync.is_active());
}
