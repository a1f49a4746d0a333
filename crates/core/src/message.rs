//! Outbound message types for network communication.

use cpos_messages::BeliefGossip;

/// Outbound network messages.
///
/// The runner handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// The sender's latest belief.
    Belief(Box<BeliefGossip>),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Belief(_) => "Belief",
        }
    }
}
