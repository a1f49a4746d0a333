use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous event handler.
///
/// Implementations must produce the same actions for the same state, time
/// and event, so that simulation runs can be replayed from a seed.
pub trait StateMachine {
    /// Process one event and return the actions to perform.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current time. Called by the runner before each `handle`.
    fn set_time(&mut self, now: Duration);

    fn now(&self) -> Duration;
}
