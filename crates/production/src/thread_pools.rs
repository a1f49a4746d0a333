//! Threads for a production peer.
//!
//! A peer's work splits in two:
//!
//! - **Consensus pool** (rayon): every state machine transition, so belief
//!   merges and the signature checks spawned while agreed blocks are applied
//!   stay off the gossip threads
//! - **I/O runtime** (tokio): inbound and outbound gossip, checkpoint writes,
//!   timers and the metrics endpoint
//!
//! Several peers in one process share a single [`ThreadPoolManager`].
//!
//! ```no_run
//! use cpos_production::{ThreadPoolConfig, ThreadPoolManager};
//!
//! let config = ThreadPoolConfig::builder()
//!     .consensus_threads(4)
//!     .io_threads(2)
//!     .build()
//!     .unwrap();
//!
//! let manager = ThreadPoolManager::new(config).unwrap();
//! ```

use std::num::NonZeroUsize;
use thiserror::Error;

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ThreadPoolError {
    #[error("Failed to build thread pool: {0}")]
    BuildError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Core pinning failed: {0}")]
    CorePinningError(String),
}

/// Thread counts and placement for a production peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    /// Rayon threads running merges and block pre-validation.
    pub consensus_threads: usize,

    /// Tokio worker threads.
    pub io_threads: usize,

    /// Pin consensus threads to consecutive cores.
    pub pin_cores: bool,

    /// First core for the consensus pool when pinning.
    pub consensus_core_start: Option<usize>,

    /// Stack size of consensus threads in bytes.
    pub consensus_stack_size: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

impl ThreadPoolConfig {
    /// Split the available cores. A quarter, at least one, go to the I/O
    /// runtime and the rest to the consensus pool.
    pub fn auto() -> Self {
        Self::for_core_count(available_cores())
    }

    pub fn for_core_count(total_cores: usize) -> Self {
        let total = total_cores.max(2);
        let io_threads = (total / 4).max(1);
        Self {
            consensus_threads: (total - io_threads).max(1),
            io_threads,
            ..Self::minimal()
        }
    }

    /// One thread each. Used by tests and single-peer tools.
    pub fn minimal() -> Self {
        Self {
            consensus_threads: 1,
            io_threads: 1,
            pin_cores: false,
            consensus_core_start: None,
            consensus_stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn builder() -> ThreadPoolConfigBuilder {
        ThreadPoolConfigBuilder::new()
    }

    pub fn total_threads(&self) -> usize {
        self.consensus_threads + self.io_threads
    }

    pub fn validate(&self) -> Result<(), ThreadPoolError> {
        for (name, count) in [
            ("consensus_threads", self.consensus_threads),
            ("io_threads", self.io_threads),
        ] {
            if count == 0 {
                return Err(ThreadPoolError::InvalidConfig(format!(
                    "{name} must be at least 1"
                )));
            }
        }

        if self.pin_cores {
            let needed = self.consensus_core_start.unwrap_or(0) + self.consensus_threads;
            let available = available_cores();
            if needed > available {
                return Err(ThreadPoolError::InvalidConfig(format!(
                    "pinning the consensus pool needs {needed} cores, {available} available"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ThreadPoolConfigBuilder {
    config: ThreadPoolConfig,
}

impl ThreadPoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ThreadPoolConfig::auto(),
        }
    }

    pub fn consensus_threads(mut self, count: usize) -> Self {
        self.config.consensus_threads = count;
        self
    }

    pub fn io_threads(mut self, count: usize) -> Self {
        self.config.io_threads = count;
        self
    }

    pub fn pin_cores(mut self, enabled: bool) -> Self {
        self.config.pin_cores = enabled;
        self
    }

    /// Pin the consensus pool starting at `core`.
    pub fn consensus_core_start(mut self, core: usize) -> Self {
        self.config.consensus_core_start = Some(core);
        self.config.pin_cores = true;
        self
    }

    pub fn consensus_stack_size(mut self, size: usize) -> Self {
        self.config.consensus_stack_size = size;
        self
    }

    pub fn build(self) -> Result<ThreadPoolConfig, ThreadPoolError> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn build_unchecked(self) -> ThreadPoolConfig {
        self.config
    }
}

impl Default for ThreadPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the consensus pool and builds the tokio runtime.
///
/// Block application runs on the thread that called `update_state`; only
/// the signature checks it spawns fan out. Running transitions through
/// [`in_consensus_pool`](Self::in_consensus_pool) keeps those spawns on
/// this pool rather than rayon's global one.
pub struct ThreadPoolManager {
    config: ThreadPoolConfig,
    consensus_pool: rayon::ThreadPool,
}

impl ThreadPoolManager {
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        config.validate()?;
        let consensus_pool = build_consensus_pool(&config)?;

        tracing::info!(
            consensus_threads = config.consensus_threads,
            io_threads = config.io_threads,
            pin_cores = config.pin_cores,
            "Thread pools initialized"
        );
        Ok(Self {
            config,
            consensus_pool,
        })
    }

    pub fn auto() -> Result<Self, ThreadPoolError> {
        Self::new(ThreadPoolConfig::auto())
    }

    pub fn consensus_pool(&self) -> &rayon::ThreadPool {
        &self.consensus_pool
    }

    /// Run `f` on the consensus pool and wait for its result.
    pub fn in_consensus_pool<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.consensus_pool.install(f)
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.config
    }

    pub fn io_threads(&self) -> usize {
        self.config.io_threads
    }

    pub fn build_tokio_runtime(&self) -> Result<tokio::runtime::Runtime, ThreadPoolError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.io_threads)
            .thread_name("cpos-io")
            .enable_all()
            .build()
            .map_err(|e| ThreadPoolError::BuildError(e.to_string()))
    }
}

fn build_consensus_pool(config: &ThreadPoolConfig) -> Result<rayon::ThreadPool, ThreadPoolError> {
    let mut builder = rayon::ThreadPoolBuilder::new()
        .num_threads(config.consensus_threads)
        .stack_size(config.consensus_stack_size)
        .thread_name(|i| format!("consensus-{i}"));

    if config.pin_cores {
        let first = config.consensus_core_start.unwrap_or(0);
        builder = builder.start_handler(move |thread| {
            let core = first + thread;
            match pin_thread_to_core(core) {
                Ok(()) => tracing::debug!(core, thread, "Pinned consensus thread"),
                Err(e) => tracing::warn!(core, error = %e, "Failed to pin consensus thread"),
            }
        });
    }

    builder
        .build()
        .map_err(|e| ThreadPoolError::BuildError(e.to_string()))
}

#[cfg(target_os = "linux")]
fn pin_thread_to_core(core: usize) -> Result<(), ThreadPoolError> {
    // SAFETY: cpu_set_t is plain data and sched_setaffinity only reads it.
    let result = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if result == 0 {
        Ok(())
    } else {
        Err(ThreadPoolError::CorePinningError(format!(
            "sched_setaffinity failed for core {core}"
        )))
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_thread_to_core(core: usize) -> Result<(), ThreadPoolError> {
    tracing::debug!(core, "Core pinning not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_config_is_valid() {
        let config = ThreadPoolConfig::auto();
        assert!(config.consensus_threads >= 1);
        assert!(config.io_threads >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_core_split() {
        let split = |cores| {
            let config = ThreadPoolConfig::for_core_count(cores);
            (config.consensus_threads, config.io_threads)
        };
        assert_eq!(split(1), (1, 1));
        assert_eq!(split(4), (3, 1));
        assert_eq!(split(16), (12, 4));
    }

    #[test]
    fn test_builder_overrides() {
        let config = ThreadPoolConfig::builder()
            .consensus_threads(4)
            .io_threads(2)
            .build_unchecked();
        assert_eq!(config.total_threads(), 6);
        assert!(!config.pin_cores);

        let pinned = ThreadPoolConfig::builder()
            .consensus_core_start(1)
            .build_unchecked();
        assert!(pinned.pin_cores);
        assert_eq!(pinned.consensus_core_start, Some(1));
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(ThreadPoolConfig::builder().consensus_threads(0).build().is_err());
        assert!(ThreadPoolConfig::builder().io_threads(0).build().is_err());
    }

    #[test]
    fn test_pinning_past_available_cores_rejected() {
        let config = ThreadPoolConfig::builder()
            .consensus_threads(1)
            .consensus_core_start(available_cores())
            .build_unchecked();
        assert!(matches!(
            config.validate(),
            Err(ThreadPoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_transitions_run_on_consensus_pool() {
        let manager = ThreadPoolManager::new(ThreadPoolConfig::minimal()).unwrap();
        let name = manager.in_consensus_pool(|| std::thread::current().name().map(str::to_owned));
        assert_eq!(name.as_deref(), Some("consensus-0"));
        assert_eq!(manager.io_threads(), 1);
    }
}
