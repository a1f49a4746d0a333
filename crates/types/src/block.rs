//! Blocks and transactions.

use crate::{Signed, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A client transaction.
///
/// The payload is opaque to consensus; only the block executor interprets
/// it. `sequence` lets the executor reject replays from the same signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

pub type SignedTransaction = Signed<Transaction>;

/// A proposed block.
///
/// The timestamp is the proposer's clock when the block was created and is
/// used to order newly discovered blocks during belief merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub timestamp: Timestamp,
    pub transactions: Vec<SignedTransaction>,
}

pub type SignedBlock = Signed<Block>;

impl Block {
    pub fn new(timestamp: Timestamp, transactions: Vec<SignedTransaction>) -> Self {
        Block {
            timestamp,
            transactions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl Signed<Block> {
    /// Validate the block signature and every transaction signature.
    ///
    /// All results are memoized, so a later executor pass pays nothing for
    /// values already checked here.
    pub fn is_fully_valid(&self) -> bool {
        let block_ok = self.verify();
        let txs_ok = self.value().transactions.iter().all(|tx| tx.verify());
        block_ok && txs_ok
    }
}

/// Order blocks by their embedded creation timestamp.
///
/// Used with a stable sort, so blocks with equal timestamps keep their
/// discovery order.
pub fn compare_block_timestamps(a: &SignedBlock, b: &SignedBlock) -> Ordering {
    a.value().timestamp.cmp(&b.value().timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    #[test]
    fn test_block_signature_covers_transactions() {
        let keypair = KeyPair::from_seed([4u8; 32]);
        let tx = Signed::sign(
            &keypair,
            Transaction {
                sequence: 1,
                payload: b"pay".to_vec(),
            },
        );
        let block = Signed::sign(&keypair, Block::new(10, vec![tx]));
        assert!(block.is_fully_valid());

        let forged = Signed::from_parts(
            Block::new(11, block.value().transactions.clone()),
            block.signer(),
            *block.signature(),
        );
        assert!(!forged.is_fully_valid());
    }

    #[test]
    fn test_timestamp_ordering() {
        let keypair = KeyPair::from_seed([4u8; 32]);
        let early = Signed::sign(&keypair, Block::new(5, vec![]));
        let late = Signed::sign(&keypair, Block::new(9, vec![]));
        assert_eq!(compare_block_timestamps(&early, &late), Ordering::Less);
        assert_eq!(compare_block_timestamps(&late, &late), Ordering::Equal);
    }
}
