//! Gossip networking: wire codec and transports.

mod codec;
mod transport;

pub use codec::{decode_belief, encode_message, CodecError, WIRE_VERSION};
pub use transport::{Delivery, Frame, GossipTransport, LocalHub, LocalTransport};
