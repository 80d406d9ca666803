//! State machine trait.

use crate::{Action, Event};
use std::time::Duration;

/// The composed node state machine.
///
/// Implementations are:
/// - **Synchronous**: no async, no `.await`
/// - **Deterministic**: same state + event = same actions
/// - **Single-writer**: the caller guarantees `handle` is never re-entered
///
/// Storage reads and the atomic block-commit batch happen inside `handle`;
/// network I/O and timers are always delegated to the runner via actions.
pub trait StateMachine {
    /// Process one event, returning the actions to execute.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the machine's notion of "now" before delivering an event.
    fn set_time(&mut self, now: Duration);
}
