//! Message encoding and decoding for gossip transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: canonical encoding of the gossip struct]
//! ```
//!
//! Only beliefs travel over gossip, so the payload type is implied.

use cpos_core::OutboundMessage;
use cpos_messages::{BeliefGossip, DecodeError};
use cpos_types::EncodingError;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Encode error: {0}")]
    Encode(#[from] EncodingError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Encode an outbound message to wire format.
pub fn encode_message(message: &OutboundMessage) -> Result<Vec<u8>, CodecError> {
    let payload = match message {
        OutboundMessage::Belief(gossip) => gossip.encode()?,
    };

    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a belief frame. The payload may be at most `max_size` bytes.
pub fn decode_belief(data: &[u8], max_size: usize) -> Result<BeliefGossip, CodecError> {
    let (&version, payload) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    Ok(BeliefGossip::decode(payload, max_size)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpos_belief::Belief;
    use cpos_messages::MAX_GOSSIP_BYTES;
    use cpos_types::test_utils::test_keypair;
    use cpos_types::Hash;

    fn belief_message() -> OutboundMessage {
        let keypair = test_keypair(1);
        let belief = Belief::create_single_order(&keypair);
        OutboundMessage::Belief(Box::new(BeliefGossip::new(
            Hash::from_bytes(b"net"),
            keypair.public_key(),
            belief,
        )))
    }

    #[test]
    fn test_frame_carries_version_and_decodes() {
        let bytes = encode_message(&belief_message()).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);

        let decoded = decode_belief(&bytes, MAX_GOSSIP_BYTES).unwrap();
        assert_eq!(decoded.sender, test_keypair(1).public_key());
        assert_eq!(decoded.network_id, Hash::from_bytes(b"net"));
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(matches!(
            decode_belief(&[], MAX_GOSSIP_BYTES),
            Err(CodecError::MessageTooShort)
        ));

        let mut bytes = encode_message(&belief_message()).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            decode_belief(&bytes, MAX_GOSSIP_BYTES),
            Err(CodecError::UnknownVersion(9))
        ));

        bytes[0] = WIRE_VERSION;
        assert!(matches!(
            decode_belief(&bytes, 8),
            Err(CodecError::Decode(DecodeError::TooLarge { .. }))
        ));
    }
}
