use cpos_peer::PeerConfig;
use std::time::Duration;

/// Belief broadcast policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationConfig {
    /// Minimum time between two broadcasts.
    pub min_broadcast_delay: Duration,

    /// Broadcast the unchanged belief again after this long, so peers that
    /// missed the last message eventually catch up.
    pub rebroadcast_delay: Duration,

    /// Capacity of the inbound belief queue in runners that have one.
    pub queue_capacity: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            min_broadcast_delay: Duration::from_millis(50),
            rebroadcast_delay: Duration::from_millis(2000),
            queue_capacity: 10,
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeConfig {
    pub peer: PeerConfig,

    pub propagation: PropagationConfig,

    /// Block results whose state is older than this are pruned.
    pub history_retention: Duration,

    /// Interval between cleanup timer ticks.
    pub cleanup_interval: Duration,

    /// Stake needed before submitted blocks are proposed. A lone peer may
    /// always propose.
    pub min_publish_stake: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            propagation: PropagationConfig::default(),
            history_retention: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(10),
            min_publish_stake: 1,
        }
    }
}
