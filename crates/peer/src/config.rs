//! Peer configuration.

use cpos_belief::MergeConfig;
use serde::{Deserialize, Serialize};

/// Peer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Thresholds and timing for belief merge.
    pub merge: MergeConfig,

    /// Roll applied state back to a common checkpoint when the agreed
    /// history diverges from what was already applied. When disabled a fork
    /// is fatal.
    pub fork_recovery: bool,

    /// Verify signatures of newly agreed blocks on the rayon pool while they
    /// are applied.
    pub parallel_verification: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            merge: MergeConfig::default(),
            fork_recovery: false,
            parallel_verification: true,
        }
    }
}

impl PeerConfig {
    pub fn with_fork_recovery(mut self, enabled: bool) -> Self {
        self.fork_recovery = enabled;
        self
    }

    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }
}
