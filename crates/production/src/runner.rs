//! The production event loop.

use crate::handle::{NodeHandle, NodeStatus};
use crate::metrics;
use crate::network::{
    codec, Handled, InboundMessage, PeerNetwork, PeerRequest, ServeKind, ServeRequest,
    TransportAdapter, TransportConfig,
};
use crate::timers::TimerManager;
use forgeline_chain::DataAccess;
use forgeline_core::{Action, ChainEvent, Event, StateMachine};
use forgeline_messages::{
    BlocksFromIdResponse, HighestCommonBlockResponse, TransactionsResponse, BLOCKS_PER_CHUNK,
};
use forgeline_node::NodeStateMachine;
use forgeline_types::{Hash, Transaction};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

/// Errors from the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Event channel closed")]
    ChannelClosed,
}

/// Handle for shutting down a running [`NodeRunner`].
///
/// Dropping the handle also signals shutdown.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown, consuming the handle.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// The production runner: one task owning the node state machine.
///
/// Events arrive on two channels — operator events from the handle and
/// decoded peer traffic through the transport adapter. Each event is
/// processed to completion, internal follow-ups first, before the next one
/// is taken; that ordering is what makes observer notifications match block
/// application order.
pub struct NodeRunner {
    node: NodeStateMachine,
    timers: TimerManager,
    adapter: TransportAdapter,
    network: Arc<dyn PeerNetwork>,
    event_rx: mpsc::Receiver<Event>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    shutdown_rx: oneshot::Receiver<()>,
    events_out: broadcast::Sender<ChainEvent>,
    status: Arc<RwLock<NodeStatus>>,
    pool_mirror: Arc<RwLock<HashMap<Hash, Transaction>>>,
    boot_actions: Vec<Action>,
}

impl NodeRunner {
    /// Assemble the runner around a built node.
    ///
    /// `boot_actions` are the actions returned by `NodeStateMachine::new`
    /// (timer arming and temp-region replay); they run before the first
    /// event.
    pub fn new(
        node: NodeStateMachine,
        boot_actions: Vec<Action>,
        network: Arc<dyn PeerNetwork>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        network_version: String,
    ) -> (Self, NodeHandle, ShutdownHandle) {
        let (event_tx, event_rx) = mpsc::channel(10_000);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (events_out, _) = broadcast::channel(1_024);

        let status = Arc::new(RwLock::new(NodeStatus {
            network_version,
            ..NodeStatus::default()
        }));
        let pool_mirror = Arc::new(RwLock::new(HashMap::new()));

        let handle = NodeHandle::new(
            event_tx.clone(),
            events_out.clone(),
            status.clone(),
            pool_mirror.clone(),
            node.data_access(),
            network.clone(),
        );

        let runner = Self {
            timers: TimerManager::new(event_tx),
            adapter: TransportAdapter::new(TransportConfig::default(), network.clone()),
            network,
            event_rx,
            inbound_rx,
            shutdown_rx,
            events_out,
            status,
            pool_mirror,
            boot_actions,
            node,
        };
        (runner, handle, ShutdownHandle { tx: Some(shutdown_tx) })
    }

    /// Run until shutdown.
    ///
    /// On shutdown: forger ticks stop with the timers, the synchronizer is
    /// cancelled at its next chunk boundary, and the store closes last when
    /// the node drops. In-flight block applies always complete or undo
    /// before their event returns, so there is nothing half-applied to
    /// worry about.
    pub async fn run(mut self) {
        info!("Node runner started");
        let boot_actions = std::mem::take(&mut self.boot_actions);
        self.execute(boot_actions);
        self.refresh_status();

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Shutdown requested");
                    break;
                }
                message = self.inbound_rx.recv() => {
                    match message {
                        Some(message) => self.handle_inbound(message),
                        None => {
                            warn!("Inbound channel closed; shutting down");
                            break;
                        }
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.dispatch(event),
                        None => break,
                    }
                }
            }
        }

        self.node.shutdown();
        self.timers.cancel_all();
        info!("Node runner stopped");
    }

    fn handle_inbound(&mut self, message: InboundMessage) {
        match self.adapter.handle_inbound(message, self.node.is_syncing()) {
            Handled::Events(events) => {
                for event in events {
                    self.dispatch(event);
                }
            }
            Handled::Serve(request) => self.serve(request),
            Handled::Dropped => {}
        }
    }

    /// Process one event and drain its internal follow-ups.
    #[instrument(skip_all, fields(event = event.type_name()))]
    fn dispatch(&mut self, event: Event) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.node.set_time(now);

        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let actions = self.node.handle(event);
            for action in actions {
                match action {
                    Action::EnqueueInternal { event } => queue.push_back(event),
                    other => self.execute_one(other),
                }
            }
        }
        self.refresh_status();
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::EnqueueInternal { event } => self.dispatch(event),
                other => self.execute_one(other),
            }
        }
    }

    fn execute_one(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => {
                metrics::record_message_broadcast();
                self.network.broadcast(codec::encode_message(&message));
            }
            Action::RequestNetworkTips => self.network.request_tips(),
            Action::RequestHighestCommonBlock { from, ids } => {
                let payload = codec::encode_payload(
                    &forgeline_messages::GetHighestCommonBlockRequest { ids },
                );
                self.network
                    .send_request(from, PeerRequest::HighestCommonBlock(payload));
            }
            Action::RequestBlocksFromId { from, block_id } => {
                let payload =
                    codec::encode_payload(&forgeline_messages::GetBlocksFromIdRequest { block_id });
                self.network.send_request(from, PeerRequest::BlocksFromId(payload));
            }
            Action::RequestTransactions { from, ids } => {
                let payload =
                    codec::encode_payload(&forgeline_messages::GetTransactionsRequest { ids });
                self.network.send_request(from, PeerRequest::Transactions(payload));
            }
            Action::PenalizePeer { peer, points } => {
                metrics::record_peer_penalized();
                self.network.penalize(peer, points);
            }
            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
            Action::CancelTimer { id } => self.timers.cancel_timer(id),
            Action::Emit { event } => self.emit(event),
            Action::EnqueueInternal { .. } => unreachable!("handled by the dispatch loop"),
        }
    }

    fn emit(&mut self, event: ChainEvent) {
        match &event {
            ChainEvent::NewBlock { .. } => metrics::record_block_applied(),
            ChainEvent::DeleteBlock { .. } => metrics::record_block_reverted(),
            ChainEvent::TransactionRemoved { .. } => metrics::record_transaction_removed(),
            _ => {}
        }
        // No subscribers is fine; the bus is best-effort.
        let _ = self.events_out.send(event);
    }

    /// Serve a peer RPC from the read view; the state machine is not
    /// involved.
    fn serve(&mut self, request: ServeRequest) {
        let data = self.node.data_access();
        match request.kind {
            ServeKind::BlocksFromId(rpc) => {
                let blocks = Self::blocks_from_id(&data, rpc.block_id);
                debug!(peer = %request.from, count = blocks.len(), "Serving get_blocks_from_id");
                self.network.respond(
                    request.request_id,
                    codec::encode_payload(&BlocksFromIdResponse { blocks }),
                );
            }
            ServeKind::HighestCommonBlock(rpc) => {
                let id = Self::highest_common_block(&data, &rpc.ids);
                self.network.respond(
                    request.request_id,
                    codec::encode_payload(&HighestCommonBlockResponse { id }),
                );
            }
            ServeKind::Transactions(rpc) => {
                let transactions = self.node.pooled_transactions(&rpc.ids);
                self.network.respond(
                    request.request_id,
                    codec::encode_payload(&TransactionsResponse { transactions }),
                );
            }
        }
    }

    /// Up to [`BLOCKS_PER_CHUNK`] blocks following the given id.
    fn blocks_from_id(data: &DataAccess, block_id: Hash) -> Vec<forgeline_types::Block> {
        let Ok(Some(parent)) = data.get_block_by_id(&block_id) else {
            return Vec::new();
        };
        let from = parent.height() + 1;
        data.get_blocks_by_height_range(from, from + BLOCKS_PER_CHUNK as u64 - 1)
            .unwrap_or_default()
    }

    /// The highest of the probe ids present on our canonical chain.
    fn highest_common_block(data: &DataAccess, ids: &[Hash]) -> Option<Hash> {
        let mut best: Option<(u64, Hash)> = None;
        for id in ids {
            if let Ok(Some(block)) = data.get_block_by_id(id) {
                // Only count blocks still on the canonical chain.
                let canonical = data
                    .get_block_id_at_height(block.height())
                    .ok()
                    .flatten()
                    .map(|at_height| at_height == *id)
                    .unwrap_or(false);
                if canonical && best.map(|(h, _)| block.height() > h).unwrap_or(true) {
                    best = Some((block.height(), *id));
                }
            }
        }
        best.map(|(_, id)| id)
    }

    fn refresh_status(&self) {
        let chain = self.node.processor().chain();
        {
            let mut status = self.status.write();
            status.height = chain.last_block().height();
            status.last_block_id = chain.last_block().id();
            status.finalized_height = chain.finalized_height();
            status.syncing = self.node.is_syncing();
            status.pool_size = self.node.pool().len();
            status.validators = chain.active_validators().members.clone();
        }
        {
            let mut mirror = self.pool_mirror.write();
            mirror.clear();
            for tx in self.node.pool().snapshot() {
                mirror.insert(tx.id(), tx);
            }
        }
        metrics::record_chain_height(chain.last_block().height());
        metrics::record_finalized_height(chain.finalized_height());
        metrics::record_pool_size(self.node.pool().len());
        metrics::record_sync_active(self.node.is_syncing());
    }
}
