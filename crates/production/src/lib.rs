//! Production runner with async I/O.
//!
//! This crate wraps the deterministic node state machine with real I/O:
//!
//! - Belief gossip via bounded tokio channels
//! - Timers via tokio sleeps
//! - Belief merges and signature checks on a dedicated rayon pool
//! - Checkpoints in RocksDB
//!
//! # Architecture
//!
//! A single task owns the state machine and receives events over channels,
//! so no state is shared behind a lock.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Production Peer                                 │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │  ProductionRunner                                                   ││
//! │  │    └─ loop { event = recv(); actions = state.handle(event); }       ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                │                                        │
//! │    ┌───────────────────────────┼───────────────────────────────┐        │
//! │    ▼                           ▼                               ▼        │
//! │  Consensus Pool (rayon)   BeliefPropagator              I/O Pool (tokio)│
//! │  - Belief merge           - encode + broadcast          - Inbound queue │
//! │  - Signature checks       - delivery stats              - Storage       │
//! │                                                         - Timers        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Thread Pool Configuration
//!
//! ```no_run
//! use cpos_production::{ThreadPoolConfig, ThreadPoolManager};
//! use std::sync::Arc;
//!
//! // Auto-detect cores (three quarters consensus, one quarter I/O)
//! let config = ThreadPoolConfig::auto();
//!
//! // Or pin the consensus pool for cache locality (Linux only)
//! let config = ThreadPoolConfig::builder()
//!     .consensus_threads(4)
//!     .io_threads(2)
//!     .consensus_core_start(1)
//!     .build()
//!     .unwrap();
//!
//! // Share thread pools across every peer in the process
//! let shared_pools = Arc::new(ThreadPoolManager::new(config).unwrap());
//! ```

pub mod config;
pub mod metrics;
pub mod network;
mod propagator;
mod runner;
mod storage;
pub mod telemetry;
mod thread_pools;
mod timers;

pub use config::{ConfigError, ProductionConfig};
pub use propagator::{BeliefPropagator, PropagatorStats};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError, TelemetryGuard};
pub use timers::TimerManager;

pub use runner::{
    ProductionRunner, ProductionRunnerBuilder, RunnerError, RunnerStatus, ShutdownHandle,
};
pub use storage::{CompressionType, RocksDbConfig, RocksDbStore};
pub use thread_pools::{
    ThreadPoolConfig, ThreadPoolConfigBuilder, ThreadPoolError, ThreadPoolManager,
};
