//! Belief gossip message.

use super::GossipMessage;
use cpos_belief::Belief;
use cpos_types::{encoding, EncodingError, Hash, PeerKey};
use serde::{Deserialize, Serialize};

/// Upper bound on an encoded belief message.
pub const MAX_GOSSIP_BYTES: usize = 16 * 1024 * 1024;

/// Failure to decode an incoming gossip message.
///
/// The whole message is discarded; nothing from it reaches merge.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] EncodingError),
}

/// Broadcasts a peer's latest belief.
///
/// Orders inside the belief carry their own signatures, so the sender field
/// is informational only and is never trusted for voting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeliefGossip {
    /// Genesis state hash of the sender's network.
    pub network_id: Hash,
    /// Peer that sent this belief.
    pub sender: PeerKey,
    /// The belief being gossiped.
    pub belief: Belief,
}

impl BeliefGossip {
    pub fn new(network_id: Hash, sender: PeerKey, belief: Belief) -> Self {
        Self {
            network_id,
            sender,
            belief,
        }
    }

    pub fn belief(&self) -> &Belief {
        &self.belief
    }

    pub fn into_belief(self) -> Belief {
        self.belief
    }

    /// Canonical wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        encoding::encode(self)
    }

    /// Decode untrusted bytes, bounded by `max_size`.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, DecodeError> {
        if bytes.len() > max_size {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                max: max_size,
            });
        }
        Ok(encoding::decode_with_limit(bytes, max_size as u64)?)
    }
}

impl GossipMessage for BeliefGossip {
    fn message_type_id() -> &'static str {
        "belief.gossip"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpos_types::test_utils::{test_block, test_keypair};

    fn sample() -> BeliefGossip {
        let keypair = test_keypair(1);
        let belief = Belief::create_single_order(&keypair).propose_block(
            &keypair,
            test_block(&keypair, 7),
            7,
        );
        BeliefGossip::new(Hash::from_bytes(b"genesis"), keypair.public_key(), belief)
    }

    #[test]
    fn test_decoded_orders_still_verify() {
        let gossip = sample();
        let bytes = gossip.encode().unwrap();
        let decoded = BeliefGossip::decode(&bytes, MAX_GOSSIP_BYTES).unwrap();
        assert_eq!(decoded, gossip);

        let signed = decoded.belief().signed_order(&gossip.sender).unwrap();
        assert!(!signed.is_verified());
        assert!(signed.verify());
    }

    #[test]
    fn test_rejects_oversized_message() {
        let bytes = sample().encode().unwrap();
        let err = BeliefGossip::decode(&bytes, bytes.len() - 1).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { .. }));
    }

    #[test]
    fn test_rejects_garbage_and_truncation() {
        assert!(matches!(
            BeliefGossip::decode(&[0xFF; 5], MAX_GOSSIP_BYTES),
            Err(DecodeError::Malformed(_))
        ));

        let mut bytes = sample().encode().unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(BeliefGossip::decode(&bytes, MAX_GOSSIP_BYTES).is_err());

        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert!(BeliefGossip::decode(&bytes, MAX_GOSSIP_BYTES).is_err());
    }
}
