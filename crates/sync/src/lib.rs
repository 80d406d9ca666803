//! Chain synchronizer.
//!
//! Consumes `SyncRequired` and drives one of two recovery mechanisms:
//! block synchronization for a tip that is far behind, fast chain switching
//! for a one- or two-block divergence. Mechanisms run one at a time; while
//! one is active the transport drops inbound blocks and the forger skips
//! its ticks.

mod synchronizer;

pub use synchronizer::{Mechanism, SyncConfig, Synchronizer};
