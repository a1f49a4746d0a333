use cpos_belief::MergeError;
use cpos_types::{PeerKey, StoreError};

/// Peer transition failure.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("belief has no order for local peer {peer}")]
    MissingOwnOrder { peer: PeerKey },

    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Applied history diverges from the agreed order and fork recovery is
    /// disabled.
    #[error("fork detected: {applied} blocks applied, only {common} agree with consensus")]
    ForkDetected { common: usize, applied: usize },

    /// History needed to roll back has been pruned.
    #[error("no checkpoint at position {position} (history starts at {history_position})")]
    CheckpointUnavailable {
        position: usize,
        history_position: usize,
    },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid peer data: {0}")]
    InvalidData(String),
}

impl PeerError {
    /// Whether the peer must stop participating in consensus.
    ///
    /// Storage errors only affect checkpointing; everything else means
    /// local state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerError::Store(_))
    }
}
