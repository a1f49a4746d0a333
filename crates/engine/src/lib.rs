//! Block execution seam for CPoS peers.
//!
//! This crate defines how the consensus core talks to ledger execution:
//!
//! - [`BlockExecutor`]: apply a block, compute a stake snapshot
//! - [`BlockResult`] / [`TransactionResult`]: recorded outcomes
//! - [`prevalidate_blocks`]: parallel signature checks ahead of execution
//!
//! With the `test-utils` feature it also provides [`test_utils::TestLedger`],
//! a small deterministic executor used by tests and the simulator.

mod executor;
mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use executor::{BlockExecutor, BlockResult, ErrorCode, LedgerState, TransactionResult};
pub use validation::{prevalidate_blocks, ValidationSummary};
