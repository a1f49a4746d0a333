//! Per-merge parameters.

use crate::MergeConfig;
use cpos_types::{KeyPair, Order, PeerKey, Signed, SignedOrder, StakeTable, Timestamp};
use std::sync::Arc;

/// Everything one merge invocation needs beyond the beliefs themselves.
///
/// The stake snapshot is captured when the context is created; stake changes
/// in ledger state are seen on the next merge.
#[derive(Debug, Clone)]
pub struct BeliefMergeContext {
    keypair: Arc<KeyPair>,
    peer: PeerKey,
    timestamp: Timestamp,
    stakes: Arc<StakeTable>,
    config: MergeConfig,
}

impl BeliefMergeContext {
    pub fn new(
        keypair: Arc<KeyPair>,
        timestamp: Timestamp,
        stakes: Arc<StakeTable>,
        config: MergeConfig,
    ) -> Self {
        let peer = keypair.public_key();
        Self {
            keypair,
            peer,
            timestamp,
            stakes,
            config,
        }
    }

    pub fn peer_key(&self) -> PeerKey {
        self.peer
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn stakes(&self) -> &StakeTable {
        &self.stakes
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn with_timestamp(&self, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    pub fn with_stakes(&self, stakes: Arc<StakeTable>) -> Self {
        Self {
            stakes,
            ..self.clone()
        }
    }

    /// Sign an order as the local peer.
    pub fn sign(&self, order: Order) -> SignedOrder {
        Signed::sign(&self.keypair, order)
    }
}
