//! Deterministic test ledger.
//!
//! A minimal executor used by unit tests and the simulator. Transactions carry
//! an encoded [`TestOp`]; state tracks stakes, per-signer sequence numbers and
//! a running digest of everything applied, so two peers applying the same
//! blocks end up with byte-identical states.

use crate::{BlockExecutor, BlockResult, ErrorCode, LedgerState, TransactionResult};
use cpos_types::{encoding, Hash, PeerKey, SignedBlock, StakeTable, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// Operation encoded in a test transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOp {
    /// No effect beyond bumping the sequence and digest.
    Noop,
    /// Set the signer's stake.
    SetStake(u64),
}

impl TestOp {
    pub fn to_payload(&self) -> Vec<u8> {
        encoding::encode(self).expect("test op should be encodable")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestState {
    pub timestamp: Timestamp,
    pub blocks_applied: u64,
    pub transactions_applied: u64,
    pub stakes: BTreeMap<PeerKey, u64>,
    pub sequences: BTreeMap<PeerKey, u64>,
    pub digest: Hash,
}

impl TestState {
    pub fn genesis(stakes: impl IntoIterator<Item = (PeerKey, u64)>) -> Self {
        TestState {
            timestamp: 0,
            blocks_applied: 0,
            transactions_applied: 0,
            stakes: stakes.into_iter().collect(),
            sequences: BTreeMap::new(),
            digest: Hash::ZERO,
        }
    }
}

impl LedgerState for TestState {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TestLedger;

impl BlockExecutor for TestLedger {
    type State = TestState;

    fn apply_block(&self, state: &TestState, block: &SignedBlock) -> BlockResult<TestState> {
        let transactions = &block.value().transactions;
        if !block.verify() {
            trace!(block = %block.hash(), "Rejecting block with bad signature");
            let results = transactions
                .iter()
                .map(|_| TransactionResult::failure(ErrorCode::Block, "invalid block signature"))
                .collect();
            return BlockResult::new(state.clone(), results);
        }

        let mut next = state.clone();
        next.timestamp = next.timestamp.max(block.value().timestamp);
        next.blocks_applied += 1;

        let results = transactions
            .iter()
            .map(|tx| {
                if !tx.verify() {
                    return TransactionResult::failure(ErrorCode::Signature, "invalid signature");
                }
                let signer = tx.signer();
                let expected = next.sequences.get(&signer).copied().unwrap_or(0) + 1;
                if tx.value().sequence != expected {
                    return TransactionResult::failure(
                        ErrorCode::Sequence,
                        format!("expected sequence {expected}, got {}", tx.value().sequence),
                    );
                }
                let op: TestOp = match encoding::decode(&tx.value().payload) {
                    Ok(op) => op,
                    Err(e) => return TransactionResult::failure(ErrorCode::Format, e.to_string()),
                };
                if let TestOp::SetStake(stake) = op {
                    next.stakes.insert(signer, stake);
                }
                next.sequences.insert(signer, expected);
                next.transactions_applied += 1;
                next.digest = Hash::from_parts(&[next.digest.as_bytes(), tx.hash().as_bytes()]);
                TransactionResult::success(expected.to_le_bytes())
            })
            .collect();

        BlockResult::new(next, results)
    }

    fn compute_stakes(&self, state: &TestState) -> StakeTable {
        state.stakes.iter().map(|(k, v)| (*k, *v)).collect()
    }
}
