//! Peer checkpoints.
//!
//! A checkpoint is one content-addressed [`PeerData`] value. The store's
//! root hash names the latest one, so restoring after a restart is a single
//! lookup.

use crate::{Peer, PeerConfig, PeerError};
use cpos_belief::Belief;
use cpos_engine::{BlockResult, LedgerState};
use cpos_types::{ContentStore, ContentStoreExt, Hash, KeyPair, Order, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Everything needed to rebuild a [`Peer`] apart from its key pair and
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: serde::de::DeserializeOwned"))]
pub struct PeerData<S> {
    pub belief: Belief,
    pub timestamp: Timestamp,
    pub consensus_order: Order,
    pub state_position: usize,
    pub state: S,
    pub genesis_state: S,
    pub history_position: usize,
    pub block_results: Vec<Arc<BlockResult<S>>>,
}

impl<S: LedgerState> Peer<S> {
    pub fn to_data(&self) -> PeerData<S> {
        PeerData {
            belief: self.belief.clone(),
            timestamp: self.timestamp,
            consensus_order: self.consensus_order.clone(),
            state_position: self.state_position,
            state: self.state.clone(),
            genesis_state: self.genesis_state.clone(),
            history_position: self.history_position,
            block_results: self.block_results.clone(),
        }
    }

    /// Rebuild a peer from checkpoint data, checking position bookkeeping.
    pub fn from_data(
        keypair: KeyPair,
        config: PeerConfig,
        data: PeerData<S>,
    ) -> Result<Self, PeerError> {
        if data.history_position > data.state_position {
            return Err(PeerError::InvalidData(format!(
                "history position {} beyond state position {}",
                data.history_position, data.state_position
            )));
        }
        if data.history_position + data.block_results.len() != data.state_position {
            return Err(PeerError::InvalidData(format!(
                "{} block results from position {} do not reach state position {}",
                data.block_results.len(),
                data.history_position,
                data.state_position
            )));
        }
        if data.state_position > data.consensus_order.len() {
            return Err(PeerError::InvalidData(format!(
                "state position {} beyond consensus order of {} blocks",
                data.state_position,
                data.consensus_order.len()
            )));
        }

        let key = keypair.public_key();
        if data.belief.order(&key).is_none() {
            return Err(PeerError::MissingOwnOrder { peer: key });
        }

        Ok(Peer {
            keypair: Arc::new(keypair),
            key,
            config,
            belief: data.belief,
            timestamp: data.timestamp,
            consensus_order: data.consensus_order,
            state_position: data.state_position,
            state: data.state,
            genesis_state: data.genesis_state,
            history_position: data.history_position,
            block_results: data.block_results,
        })
    }

    /// Write a checkpoint and make it the store's root.
    pub fn persist<St: ContentStore + ?Sized>(&self, store: &St) -> Result<Hash, PeerError> {
        let hash = store.persist(&self.to_data())?;
        store.set_root_hash(hash)?;
        info!(
            root = %hash,
            state_position = self.state_position,
            "Persisted peer checkpoint"
        );
        Ok(hash)
    }

    /// Restore the peer named by the store's root hash.
    ///
    /// Returns `Ok(None)` for an empty store.
    pub fn restore<St: ContentStore + ?Sized>(
        store: &St,
        keypair: KeyPair,
        config: PeerConfig,
    ) -> Result<Option<Self>, PeerError> {
        let Some(root) = store.root_hash()? else {
            return Ok(None);
        };
        let data: PeerData<S> = store.resolve(&root)?.ok_or_else(|| {
            PeerError::InvalidData(format!("root {root} missing from store"))
        })?;
        let peer = Self::from_data(keypair, config, data)?;
        info!(
            root = %root,
            state_position = peer.state_position,
            "Restored peer checkpoint"
        );
        Ok(Some(peer))
    }
}
