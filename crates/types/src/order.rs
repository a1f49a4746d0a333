//! Orders: a peer's candidate block sequence with proposal and consensus
//! watermarks.

use crate::{encoding::hash_value, Hash, SignedBlock, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Order invariant violation.
///
/// Raised when a derivation would break
/// `consensus_point <= proposal_point <= len(blocks)` or move the consensus
/// point backwards. These are defects in the caller, never a response to
/// remote input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("proposal point {proposal_point} beyond {len} blocks")]
    ProposalBeyondBlocks { proposal_point: usize, len: usize },

    #[error("consensus point {consensus_point} beyond proposal point {proposal_point}")]
    ConsensusBeyondProposal {
        consensus_point: usize,
        proposal_point: usize,
    },

    #[error("proposal point {proposal_point} below consensus point {consensus_point}")]
    ProposalBelowConsensus {
        proposal_point: usize,
        consensus_point: usize,
    },

    #[error("consensus point would regress from {from} to {to}")]
    ConsensusRegression { from: usize, to: usize },
}

/// Immutable ordering of signed blocks.
///
/// The block sequence is shared between derived orders, so every `with_*`
/// derivation is O(1) apart from `append`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "OrderRepr", into = "OrderRepr")]
pub struct Order {
    blocks: Arc<[SignedBlock]>,
    proposal_point: usize,
    consensus_point: usize,
    timestamp: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct OrderRepr {
    blocks: Vec<SignedBlock>,
    proposal_point: usize,
    consensus_point: usize,
    timestamp: Timestamp,
}

impl TryFrom<OrderRepr> for Order {
    type Error = OrderError;

    fn try_from(repr: OrderRepr) -> Result<Self, Self::Error> {
        Order::from_parts(
            repr.blocks.into(),
            repr.proposal_point,
            repr.consensus_point,
            repr.timestamp,
        )
    }
}

impl From<Order> for OrderRepr {
    fn from(order: Order) -> Self {
        OrderRepr {
            blocks: order.blocks.to_vec(),
            proposal_point: order.proposal_point,
            consensus_point: order.consensus_point,
            timestamp: order.timestamp,
        }
    }
}

impl Default for Order {
    fn default() -> Self {
        Self::create()
    }
}

impl Order {
    /// Empty order at timestamp zero.
    pub fn create() -> Self {
        Order {
            blocks: Arc::from(Vec::new()),
            proposal_point: 0,
            consensus_point: 0,
            timestamp: 0,
        }
    }

    /// Build an order from its parts, checking the invariant.
    pub fn from_parts(
        blocks: Arc<[SignedBlock]>,
        proposal_point: usize,
        consensus_point: usize,
        timestamp: Timestamp,
    ) -> Result<Self, OrderError> {
        check_points(blocks.len(), proposal_point, consensus_point)?;
        Ok(Order {
            blocks,
            proposal_point,
            consensus_point,
            timestamp,
        })
    }

    pub fn blocks(&self) -> &[SignedBlock] {
        &self.blocks
    }

    /// Shared handle to the block sequence.
    pub fn shared_blocks(&self) -> Arc<[SignedBlock]> {
        Arc::clone(&self.blocks)
    }

    pub fn block(&self, index: usize) -> Option<&SignedBlock> {
        self.blocks.get(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn proposal_point(&self) -> usize {
        self.proposal_point
    }

    pub fn consensus_point(&self) -> usize {
        self.consensus_point
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Replace the block sequence, keeping both points.
    pub fn with_blocks(&self, blocks: Arc<[SignedBlock]>) -> Result<Self, OrderError> {
        Order::from_parts(blocks, self.proposal_point, self.consensus_point, self.timestamp)
    }

    pub fn with_proposal_point(&self, proposal_point: usize) -> Result<Self, OrderError> {
        if proposal_point < self.consensus_point {
            return Err(OrderError::ProposalBelowConsensus {
                proposal_point,
                consensus_point: self.consensus_point,
            });
        }
        Order::from_parts(
            self.shared_blocks(),
            proposal_point,
            self.consensus_point,
            self.timestamp,
        )
    }

    /// Move the consensus point. It may never move backwards.
    pub fn with_consensus_point(&self, consensus_point: usize) -> Result<Self, OrderError> {
        if consensus_point < self.consensus_point {
            return Err(OrderError::ConsensusRegression {
                from: self.consensus_point,
                to: consensus_point,
            });
        }
        Order::from_parts(
            self.shared_blocks(),
            self.proposal_point,
            consensus_point,
            self.timestamp,
        )
    }

    pub fn with_timestamp(&self, timestamp: Timestamp) -> Self {
        Order {
            timestamp,
            ..self.clone()
        }
    }

    /// Append one block after the current sequence. Points are unchanged.
    pub fn append(&self, block: SignedBlock) -> Self {
        let mut blocks = Vec::with_capacity(self.blocks.len() + 1);
        blocks.extend_from_slice(&self.blocks);
        blocks.push(block);
        Order {
            blocks: blocks.into(),
            ..self.clone()
        }
    }

    /// Number of leading blocks identical between the two orders.
    pub fn common_prefix_length(&self, other: &Order) -> usize {
        common_prefix_length(&self.blocks, &other.blocks)
    }

    /// Neither order disagrees with the other's confirmed history.
    pub fn is_consistent(&self, other: &Order) -> bool {
        let confirmed = self.consensus_point.min(other.consensus_point);
        self.common_prefix_length(other) >= confirmed
    }

    /// Same blocks and points, ignoring the timestamp.
    pub fn consensus_equals(&self, other: &Order) -> bool {
        self.proposal_point == other.proposal_point
            && self.consensus_point == other.consensus_point
            && self.blocks_equal(other)
    }

    pub fn blocks_equal(&self, other: &Order) -> bool {
        Arc::ptr_eq(&self.blocks, &other.blocks)
            || (self.blocks.len() == other.blocks.len()
                && self.common_prefix_length(other) == self.blocks.len())
    }

    /// Digest identifying the block sequence alone.
    pub fn blocks_digest(&self) -> Hash {
        sequence_digest(&self.blocks)
    }

    /// Content hash of the whole order.
    pub fn hash(&self) -> Hash {
        hash_value(self)
    }
}

impl PartialEq for Order {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.consensus_equals(other)
    }
}

impl Eq for Order {}

impl std::fmt::Debug for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Order")
            .field("len", &self.blocks.len())
            .field("proposal_point", &self.proposal_point)
            .field("consensus_point", &self.consensus_point)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

fn check_points(len: usize, proposal_point: usize, consensus_point: usize) -> Result<(), OrderError> {
    if proposal_point > len {
        return Err(OrderError::ProposalBeyondBlocks {
            proposal_point,
            len,
        });
    }
    if consensus_point > proposal_point {
        return Err(OrderError::ConsensusBeyondProposal {
            consensus_point,
            proposal_point,
        });
    }
    Ok(())
}

/// Number of leading blocks with identical hashes.
pub fn common_prefix_length(a: &[SignedBlock], b: &[SignedBlock]) -> usize {
    a.iter()
        .zip(b.iter())
        .take_while(|(x, y)| x.ptr_eq(y) || x.hash() == y.hash())
        .count()
}

/// Digest of a block sequence: blake3 over the concatenated block hashes.
pub fn sequence_digest(blocks: &[SignedBlock]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(blocks.len() as u64).to_le_bytes());
    for block in blocks {
        hasher.update(block.hash().as_bytes());
    }
    Hash::from_hash_bytes(*hasher.finalize().as_bytes())
}
