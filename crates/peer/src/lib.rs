//! CPoS peer.
//!
//! A [`Peer`] couples a belief with the ledger state produced by the blocks
//! that belief has confirmed:
//!
//! - merge incoming beliefs with stakes taken from the current state
//! - apply newly confirmed blocks, recording per-block results
//! - detect forks against applied history and optionally roll back
//! - checkpoint to and restore from a content-addressed store
//!
//! Peers are immutable values; every transition returns a new peer.

mod config;
mod error;
mod peer;
mod persist;

pub use config::PeerConfig;
pub use error::PeerError;
pub use peer::Peer;
pub use persist::PeerData;
