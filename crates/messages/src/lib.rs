//! Network messages for belief propagation.
//!
//! Peers exchange a single message type: a [`BeliefGossip`] carrying the
//! sender's latest belief. Messages use the canonical encoding from
//! `cpos_types::encoding` and are decoded with a size bound because they
//! come from untrusted peers.

pub mod gossip;

pub use gossip::{BeliefGossip, DecodeError, GossipMessage, MAX_GOSSIP_BYTES};
