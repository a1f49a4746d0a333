//! CPoS node state machine.
//!
//! [`NodeStateMachine`] wraps a [`cpos_peer::Peer`] and its block executor
//! behind the [`cpos_core::StateMachine`] contract. It decides when beliefs
//! are merged, when state advances, and when the own belief is broadcast.

mod config;
mod state;

pub use config::{NodeConfig, PropagationConfig};
pub use state::{NodeIndex, NodeStateMachine, NodeStats};
