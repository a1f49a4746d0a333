use cpos_types::{OrderError, PeerKey};

/// Fatal merge failure.
///
/// Routine outcomes (no winner, rejected orders) are not errors. Anything
/// surfacing here means the local belief or the algorithm itself is broken,
/// and the peer must stop participating in consensus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("belief has no order for local peer {peer}")]
    MissingOwnOrder { peer: PeerKey },

    #[error("order invariant violated: {0}")]
    Order(#[from] OrderError),
}
