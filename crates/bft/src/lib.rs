//! BFT finality manager.
//!
//! Tracks the prevotes implied by block headers and derives the finalized
//! height. The manager is a pure function of the observed headers and the
//! active validator set; persistence of its records rides in the block
//! commit batch assembled by the processor.

mod finality;

pub use finality::{BftConfig, BftError, BftRecord, BftUpdate, FinalityManager};
