//! Core types for CPoS nodes.
//!
//! This crate provides the event-driven contract between a node and its
//! runner:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait that node state machines implement
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is synchronous and deterministic and performs no I/O.
//! The runner (simulation or production) delivers events, executes the
//! returned actions and turns their results back into events.

mod action;
mod event;
mod message;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use message::OutboundMessage;
pub use traits::StateMachine;

/// Timer identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Belief broadcast check
    Broadcast,
    /// Periodic history pruning
    Cleanup,
}
