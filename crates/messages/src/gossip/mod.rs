//! Gossip messages.

mod belief;

pub use belief::{BeliefGossip, DecodeError, MAX_GOSSIP_BYTES};

/// A message broadcast to every connected peer.
pub trait GossipMessage {
    /// Stable identifier used for topic routing and metrics labels.
    fn message_type_id() -> &'static str;
}
