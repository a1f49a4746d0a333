//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, TimerId};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to every connected peer.
    ///
    /// Fire-and-forget: delivery failures are reported by the runner, never
    /// retried by the state machine.
    Broadcast { message: OutboundMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Replaces a pending timer with
    /// the same id.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Write a checkpoint of the current peer.
    ///
    /// The runner reads the peer from the state machine when executing this.
    /// Returns `Event::CheckpointPersisted` on success.
    PersistCheckpoint,

    // ═══════════════════════════════════════════════════════════════════════
    // Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Newly agreed blocks were applied to state.
    ConsensusAdvanced {
        consensus_point: usize,
        state_position: usize,
    },

    /// A fatal error occurred. The node has stopped participating in
    /// consensus and needs external intervention.
    StopConsensus { reason: String },
}

impl Action {
    /// Get a human-readable name for this action type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::PersistCheckpoint => "PersistCheckpoint",
            Action::ConsensusAdvanced { .. } => "ConsensusAdvanced",
            Action::StopConsensus { .. } => "StopConsensus",
        }
    }
}
