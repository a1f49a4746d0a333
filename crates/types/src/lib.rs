//! Core types for CPoS consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, peer keys and signatures, canonical encoding
//! - **Signed values**: `Signed<T>` with memoized hash and verification
//! - **Consensus types**: Block, Transaction, Order, StakeTable
//! - **Storage**: the content-addressed store contract
//!
//! It does not depend on any other workspace crate.

mod block;
mod crypto;
pub mod encoding;
mod hash;
mod order;
mod signed;
mod stake;
mod store;

pub use block::{compare_block_timestamps, Block, SignedBlock, SignedTransaction, Transaction};
pub use crypto::{KeyPair, PeerKey, Signature};
pub use encoding::EncodingError;
pub use hash::{Hash, HexError};
pub use order::{common_prefix_length, sequence_digest, Order, OrderError};
pub use signed::Signed;
pub use stake::{exceeds_threshold, StakeTable};
pub use store::{ContentStore, ContentStoreExt, MemoryStore, StoreError};

/// Logical time in milliseconds.
pub type Timestamp = u64;

/// Signed order, as held in a belief.
pub type SignedOrder = Signed<Order>;

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic key pair for test peer `index`.
    pub fn test_keypair(index: u8) -> KeyPair {
        let mut seed = [0u8; 32];
        seed[0] = index;
        seed[31] = 0xC9;
        KeyPair::from_seed(seed)
    }

    /// Signed empty block created at `timestamp`.
    pub fn test_block(keypair: &KeyPair, timestamp: Timestamp) -> SignedBlock {
        Signed::sign(keypair, Block::new(timestamp, vec![]))
    }

    /// Signed transaction with the given sequence number and payload.
    pub fn test_transaction(keypair: &KeyPair, sequence: u64, payload: &[u8]) -> SignedTransaction {
        Signed::sign(
            keypair,
            Transaction {
                sequence,
                payload: payload.to_vec(),
            },
        )
    }

    /// Order over `blocks` with the given points and timestamp.
    pub fn test_order(
        blocks: &[SignedBlock],
        proposal_point: usize,
        consensus_point: usize,
        timestamp: Timestamp,
    ) -> Order {
        Order::from_parts(blocks.to_vec().into(), proposal_point, consensus_point, timestamp)
            .expect("test order points must be valid")
    }
}
