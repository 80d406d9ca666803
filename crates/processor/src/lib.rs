//! Block processor.
//!
//! The serialized gate through which every block — locally forged, received
//! from a peer, or replayed from the temp region — must pass. Owns the chain
//! state machine and the only mutable chain reference during an apply.

mod fork_choice;
mod processor;

pub use fork_choice::{tiebreak_wins, ForkDecision};
pub use processor::{
    BlockProcessor, Origin, ProcessError, ProcessorConfig, ValidationError, VerificationError,
};
