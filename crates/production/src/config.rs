//! TOML node configuration.
//!
//! Every section is optional; a missing field takes its default. Example:
//!
//! ```toml
//! [node]
//! data_dir = "./data"
//! peers = 4
//! stake = 100
//! block_interval_ms = 500
//!
//! [peer]
//! proposal_threshold = 0.5
//! consensus_threshold = 0.67
//! fork_recovery = true
//!
//! [propagation]
//! min_broadcast_delay_ms = 50
//! queue_capacity = 10
//!
//! [threads]
//! consensus_threads = 4
//!
//! [telemetry]
//! metrics_enabled = true
//! metrics_addr = "0.0.0.0:9090"
//! ```

use crate::storage::{CompressionType, RocksDbConfig};
use crate::telemetry::TelemetryConfig;
use crate::thread_pools::ThreadPoolConfig;
use cpos_belief::MergeConfig;
use cpos_messages::MAX_GOSSIP_BYTES;
use cpos_node::{NodeConfig, PropagationConfig};
use cpos_peer::PeerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProductionConfig {
    pub node: NodeSection,
    pub peer: PeerSection,
    pub propagation: PropagationSection,
    pub threads: ThreadsSection,
    pub storage: StorageSection,
    pub telemetry: TelemetrySection,
}

/// Local cluster layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Each peer keeps its checkpoints under `data_dir/peer-<index>`.
    pub data_dir: PathBuf,

    /// Number of in-process peers.
    pub peers: usize,

    /// Genesis stake of every peer.
    pub stake: u64,

    /// Peer keys are derived from this seed and the peer index.
    pub key_seed: u64,

    /// Interval at which each peer submits a block (0 disables submission).
    pub block_interval_ms: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            peers: 4,
            stake: 100,
            key_seed: 0,
            block_interval_ms: 500,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Merge thresholds and state advancement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    pub proposal_threshold: f64,
    pub consensus_threshold: f64,
    pub keep_proposal_time_ms: u64,
    pub fork_recovery: bool,
    pub parallel_verification: bool,
    /// Stake needed before blocks are proposed.
    pub min_publish_stake: u64,
    pub history_retention_secs: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for PeerSection {
    fn default() -> Self {
        let merge = MergeConfig::default();
        let peer = PeerConfig::default();
        let node = NodeConfig::default();
        Self {
            proposal_threshold: merge.proposal_threshold,
            consensus_threshold: merge.consensus_threshold,
            keep_proposal_time_ms: merge.keep_proposal_time.as_millis() as u64,
            fork_recovery: peer.fork_recovery,
            parallel_verification: peer.parallel_verification,
            min_publish_stake: node.min_publish_stake,
            history_retention_secs: node.history_retention.as_secs(),
            cleanup_interval_ms: node.cleanup_interval.as_millis() as u64,
        }
    }
}

/// Belief broadcast policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PropagationSection {
    pub min_broadcast_delay_ms: u64,
    pub rebroadcast_delay_ms: u64,
    /// Capacity of each peer's inbound belief queue.
    pub queue_capacity: usize,
    /// Largest accepted gossip frame in bytes.
    pub max_message_size: usize,
}

impl Default for PropagationSection {
    fn default() -> Self {
        let propagation = PropagationConfig::default();
        Self {
            min_broadcast_delay_ms: propagation.min_broadcast_delay.as_millis() as u64,
            rebroadcast_delay_ms: propagation.rebroadcast_delay.as_millis() as u64,
            queue_capacity: propagation.queue_capacity,
            max_message_size: MAX_GOSSIP_BYTES,
        }
    }
}

/// Thread pool sizes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThreadsSection {
    /// Number of consensus threads (0 = auto)
    pub consensus_threads: usize,

    /// Number of I/O threads (0 = auto)
    pub io_threads: usize,

    /// Enable CPU core pinning (Linux only)
    pub pin_cores: bool,
}

/// RocksDB tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub max_background_jobs: i32,

    /// Write buffer size in MB
    pub write_buffer_mb: usize,

    /// Block cache size in MB (0 to disable)
    pub block_cache_mb: usize,

    pub compression: CompressionType,
}

impl Default for StorageSection {
    fn default() -> Self {
        let rocksdb = RocksDbConfig::default();
        Self {
            max_background_jobs: rocksdb.max_background_jobs,
            write_buffer_mb: rocksdb.write_buffer_size / (1024 * 1024),
            block_cache_mb: rocksdb.block_cache_size.unwrap_or(0) / (1024 * 1024),
            compression: rocksdb.compression,
        }
    }
}

/// Logging and metrics endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub service_name: String,
    /// Log filter directives. `RUST_LOG` takes precedence.
    pub log_filter: Option<String>,
    pub metrics_enabled: bool,
    pub metrics_addr: SocketAddr,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        let telemetry = TelemetryConfig::default();
        Self {
            service_name: telemetry.service_name,
            log_filter: telemetry.log_filter,
            metrics_enabled: telemetry.prometheus_enabled,
            metrics_addr: telemetry.prometheus_addr,
        }
    }
}

impl ProductionConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("proposal_threshold", self.peer.proposal_threshold),
            ("consensus_threshold", self.peer.consensus_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in [0, 1), got {value}"
                )));
            }
        }
        if self.peer.consensus_threshold < self.peer.proposal_threshold {
            return Err(ConfigError::Invalid(
                "consensus_threshold must not be below proposal_threshold".to_string(),
            ));
        }
        if self.node.peers == 0 {
            return Err(ConfigError::Invalid("peers must be at least 1".to_string()));
        }
        if self.node.stake == 0 {
            return Err(ConfigError::Invalid("stake must be positive".to_string()));
        }
        if self.propagation.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.propagation.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn node_config(&self) -> NodeConfig {
        let merge = MergeConfig::default()
            .with_proposal_threshold(self.peer.proposal_threshold)
            .with_consensus_threshold(self.peer.consensus_threshold)
            .with_keep_proposal_time(Duration::from_millis(self.peer.keep_proposal_time_ms));
        NodeConfig {
            peer: PeerConfig {
                merge,
                fork_recovery: self.peer.fork_recovery,
                parallel_verification: self.peer.parallel_verification,
            },
            propagation: PropagationConfig {
                min_broadcast_delay: Duration::from_millis(self.propagation.min_broadcast_delay_ms),
                rebroadcast_delay: Duration::from_millis(self.propagation.rebroadcast_delay_ms),
                queue_capacity: self.propagation.queue_capacity,
            },
            history_retention: Duration::from_secs(self.peer.history_retention_secs),
            cleanup_interval: Duration::from_millis(self.peer.cleanup_interval_ms),
            min_publish_stake: self.peer.min_publish_stake,
        }
    }

    /// Zero thread counts fall back to the automatic split.
    pub fn thread_pool_config(&self) -> ThreadPoolConfig {
        let mut builder = ThreadPoolConfig::builder();
        if self.threads.consensus_threads > 0 {
            builder = builder.consensus_threads(self.threads.consensus_threads);
        }
        if self.threads.io_threads > 0 {
            builder = builder.io_threads(self.threads.io_threads);
        }
        if self.threads.pin_cores {
            builder = builder.pin_cores(true);
        }
        builder.build_unchecked()
    }

    pub fn rocksdb_config(&self) -> RocksDbConfig {
        RocksDbConfig {
            max_background_jobs: self.storage.max_background_jobs,
            write_buffer_size: self.storage.write_buffer_mb * 1024 * 1024,
            block_cache_size: if self.storage.block_cache_mb > 0 {
                Some(self.storage.block_cache_mb * 1024 * 1024)
            } else {
                None
            },
            compression: self.storage.compression,
            ..RocksDbConfig::default()
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.telemetry.service_name.clone(),
            log_filter: self.telemetry.log_filter.clone(),
            prometheus_enabled: self.telemetry.metrics_enabled,
            prometheus_addr: self.telemetry.metrics_addr,
        }
    }

    /// Directory holding the checkpoints of peer `index`.
    pub fn peer_data_dir(&self, index: usize) -> PathBuf {
        self.node.data_dir.join(format!("peer-{index}"))
    }
}
