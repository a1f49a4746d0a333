//! Block execution contract.
//!
//! The consensus core never interprets transactions. It hands each agreed
//! block to a [`BlockExecutor`] together with the current ledger state and
//! records whatever comes back.
//!
//! ```text
//! Peer::update_state
//!      ↓
//!      → executor.apply_block(&state, &block)   // pure, deterministic
//!      ↓
//! BlockResult { state, results }               // recorded in history
//! ```
//!
//! Executors must be deterministic and must never fail: malformed input is
//! reported as an unchanged state plus error-tagged transaction results.

use cpos_types::{SignedBlock, StakeTable, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Ledger state produced by a [`BlockExecutor`].
pub trait LedgerState:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Timestamp of the latest block applied to this state.
    fn timestamp(&self) -> Timestamp;
}

/// Applies blocks to ledger state.
///
/// Implementations are shared between the state machine and the runner's
/// worker threads, so they must be `Send + Sync`.
pub trait BlockExecutor: Send + Sync {
    type State: LedgerState;

    /// Apply one block. Never fails; invalid blocks leave the state unchanged.
    fn apply_block(&self, state: &Self::State, block: &SignedBlock) -> BlockResult<Self::State>;

    /// Stake snapshot used for voting.
    fn compute_stakes(&self, state: &Self::State) -> StakeTable;
}

/// Outcome of applying one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize",
    deserialize = "S: DeserializeOwned"
))]
pub struct BlockResult<S> {
    pub state: S,
    pub results: Vec<TransactionResult>,
}

impl<S> BlockResult<S> {
    pub fn new(state: S, results: Vec<TransactionResult>) -> Self {
        BlockResult { state, results }
    }

    pub fn transaction(&self, index: usize) -> Option<&TransactionResult> {
        self.results.get(index)
    }

    /// Number of transactions rejected by the executor.
    pub fn failure_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }
}

/// Per-transaction outcome, recorded but never interpreted by consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionResult {
    Success { value: Vec<u8> },
    Failure { code: ErrorCode, message: String },
}

impl TransactionResult {
    pub fn success(value: impl Into<Vec<u8>>) -> Self {
        TransactionResult::Success {
            value: value.into(),
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        TransactionResult::Failure {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransactionResult::Success { .. })
    }
}

/// Failure category reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Transaction or block signature did not verify.
    Signature,
    /// Replayed or out-of-order sequence number.
    Sequence,
    /// Payload could not be interpreted.
    Format,
    /// Enclosing block was rejected as a whole.
    Block,
    /// Executor-specific rule violation.
    Rejected,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Signature => "SIGNATURE",
            ErrorCode::Sequence => "SEQUENCE",
            ErrorCode::Format => "FORMAT",
            ErrorCode::Block => "BLOCK",
            ErrorCode::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}
