//! Production runner with async I/O.
//!
//! Wraps the deterministic [`forgeline_node::NodeStateMachine`] with real
//! I/O:
//!
//! - storage via RocksDB behind the `KvStore` trait
//! - timers via tokio tasks
//! - the peer network via the [`PeerNetwork`] boundary trait
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events via an mpsc channel, so chain mutation is strictly
//! serial and never contends on a lock.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        forgeline node                        │
//! │                                                              │
//! │  NodeRunner (one task)                                       │
//! │    └─ loop { event = recv(); actions = node.handle(event); } │
//! │         │                                                    │
//! │    ┌────┴──────┬───────────────┬──────────────┐              │
//! │    ▼           ▼               ▼              ▼              │
//! │  Timers      PeerNetwork     RocksDB      ChainEvent bus     │
//! │  (tokio)     (boundary)      (blocking)   (broadcast)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Internal follow-up events drain before the next external input, so
//! observers see consequences in the same relative order as block
//! application.

mod handle;
pub mod metrics;
mod network;
mod runner;
mod storage;
mod telemetry;
mod timers;

pub use handle::{HandleError, ModuleSchema, NodeHandle, NodeInfo, NodeStatus};
pub use network::{
    codec, Handled, InboundMessage, PeerNetwork, PeerRequest, ServeKind, ServeRequest,
    TransportAdapter, TransportConfig,
};
pub use runner::{NodeRunner, RunnerError, ShutdownHandle};
pub use storage::{RocksDbConfig, RocksDbStore};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use timers::TimerManager;
