//! Beliefs and the CPoS belief merge.
//!
//! A [`Belief`] maps every known peer to the latest signed [`Order`] heard
//! from it. Merging folds in beliefs received over gossip and recomputes the
//! local order through a stake-weighted vote:
//!
//! - **Accumulate**: keep the most authoritative order per peer
//! - **Filter**: drop orders contradicting our confirmed history
//! - **Vote**: pick the winning block sequence round by round
//! - **Advance**: move the proposal and consensus points by threshold
//!
//! Merge is a pure function of the local belief, the incoming beliefs and a
//! [`BeliefMergeContext`] holding the timestamp and stake snapshot.
//!
//! [`Order`]: cpos_types::Order

mod belief;
mod config;
mod context;
mod error;
mod vote;

pub use belief::{compare_orders, Belief};
pub use config::MergeConfig;
pub use context::BeliefMergeContext;
pub use error::MergeError;
