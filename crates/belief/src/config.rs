//! Merge configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds and timing for belief merge.
///
/// Passed explicitly through the merge context so tests can run the merge
/// with arbitrary thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Fraction of total stake that must agree on a prefix before it becomes
    /// the proposal point.
    pub proposal_threshold: f64,

    /// Fraction of total stake that must agree on a proposed prefix before
    /// it becomes the consensus point.
    pub consensus_threshold: f64,

    /// Minimum time a peer holds its own proposal before switching to a
    /// conflicting winner.
    pub keep_proposal_time: Duration,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            proposal_threshold: 0.5,
            consensus_threshold: 0.67,
            keep_proposal_time: Duration::from_millis(250),
        }
    }
}

impl MergeConfig {
    pub fn with_proposal_threshold(mut self, threshold: f64) -> Self {
        self.proposal_threshold = threshold;
        self
    }

    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = threshold;
        self
    }

    pub fn with_keep_proposal_time(mut self, time: Duration) -> Self {
        self.keep_proposal_time = time;
        self
    }

    /// Hold period in logical milliseconds.
    pub fn keep_proposal_millis(&self) -> u64 {
        self.keep_proposal_time.as_millis() as u64
    }
}
