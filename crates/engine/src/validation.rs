//! Parallel signature pre-validation.
//!
//! Verifying a signature depends only on the key and message bytes, so the
//! blocks agreed in one advancement pass and all their transactions can be
//! checked across cores while blocks are applied sequentially. Results are
//! memoized inside each `Signed` value; the executor later reads the cached
//! answer instead of verifying again.
//!
//! A failed check here does not cancel anything. The executor rejects the
//! affected transaction when it reaches it.

use cpos_types::SignedBlock;
use rayon::prelude::*;
use tracing::trace;

/// Summary of one pre-validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub blocks: usize,
    pub transactions: usize,
    pub invalid_blocks: usize,
    pub invalid_transactions: usize,
}

impl ValidationSummary {
    fn merge(self, other: Self) -> Self {
        ValidationSummary {
            blocks: self.blocks + other.blocks,
            transactions: self.transactions + other.transactions,
            invalid_blocks: self.invalid_blocks + other.invalid_blocks,
            invalid_transactions: self.invalid_transactions + other.invalid_transactions,
        }
    }

    pub fn all_valid(&self) -> bool {
        self.invalid_blocks == 0 && self.invalid_transactions == 0
    }
}

/// Verify every block and transaction signature in `blocks` on the current
/// rayon pool.
///
/// Call inside `ThreadPool::install` to use a dedicated consensus pool.
pub fn prevalidate_blocks(blocks: &[SignedBlock]) -> ValidationSummary {
    let summary = blocks
        .par_iter()
        .map(|block| {
            let transactions = &block.value().transactions;
            let invalid_transactions = transactions
                .par_iter()
                .filter(|tx| !tx.verify())
                .count();
            ValidationSummary {
                blocks: 1,
                transactions: transactions.len(),
                invalid_blocks: usize::from(!block.verify()),
                invalid_transactions,
            }
        })
        .reduce(ValidationSummary::default, ValidationSummary::merge);

    trace!(
        blocks = summary.blocks,
        transactions = summary.transactions,
        invalid_blocks = summary.invalid_blocks,
        invalid_transactions = summary.invalid_transactions,
        "Pre-validated block signatures"
    );
    summary
}
