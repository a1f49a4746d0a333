//! Event types for the deterministic state machine.

use cpos_messages::BeliefGossip;
use cpos_types::{Block, Hash};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// Internal events (consequences of processing an event) are handled before
/// new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,

    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Time to check whether the own belief should be broadcast.
    BroadcastTimer,

    /// Periodic pruning of old block results.
    CleanupTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// Beliefs received from other peers since the last merge.
    ///
    /// Runners batch whatever is queued; a single merge absorbs them all.
    BeliefsReceived { beliefs: Vec<BeliefGossip> },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage Callbacks (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// A checkpoint requested by `Action::PersistCheckpoint` was written.
    CheckpointPersisted { root: Hash, state_position: usize },

    // ═══════════════════════════════════════════════════════════════════════
    // Client Requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client asked this peer to propose a block.
    BlockSubmitted { block: Block },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::CheckpointPersisted { .. } => EventPriority::Internal,
            Event::BroadcastTimer | Event::CleanupTimer => EventPriority::Timer,
            Event::BeliefsReceived { .. } => EventPriority::Network,
            Event::BlockSubmitted { .. } => EventPriority::Client,
        }
    }

    /// Get a human-readable name for this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::BroadcastTimer => "BroadcastTimer",
            Event::CleanupTimer => "CleanupTimer",
            Event::BeliefsReceived { .. } => "BeliefsReceived",
            Event::CheckpointPersisted { .. } => "CheckpointPersisted",
            Event::BlockSubmitted { .. } => "BlockSubmitted",
        }
    }

    /// Check if this is a network event.
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }
}
