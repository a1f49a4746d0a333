//! CPoS Node
//!
//! Runs a local cluster of CPoS peers in one process. Peers gossip over an
//! in-process hub, keep their checkpoints in RocksDB and resume from them on
//! restart.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (4 peers, ./data)
//! cpos-node
//!
//! # Start with configuration file
//! cpos-node --config node.toml
//!
//! # Override data directory and cluster size
//! cpos-node --config node.toml --data-dir /var/lib/cpos --peers 7
//! ```
//!
//! See `ProductionConfig` for all configuration options.

use anyhow::{bail, Context, Result};
use clap::Parser;
use cpos_engine::test_utils::{TestLedger, TestOp, TestState};
use cpos_production::network::LocalHub;
use cpos_production::{
    init_telemetry, ProductionConfig, ProductionRunner, RocksDbStore, ThreadPoolManager,
};
use cpos_types::{Block, KeyPair, Signed, Transaction};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// CPoS Node
///
/// Runs a local cluster of stake-weighted gossip consensus peers.
#[derive(Parser, Debug)]
#[command(name = "cpos-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for RocksDB (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of peers (overrides config)
    #[arg(long)]
    peers: Option<usize>,

    /// Serve Prometheus metrics on this address (overrides config)
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Log filter directives (overrides config, not RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<ProductionConfig> {
        let mut config = match &self.config {
            Some(path) => ProductionConfig::load(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?,
            None => ProductionConfig::default(),
        };

        if let Some(data_dir) = &self.data_dir {
            config.node.data_dir = data_dir.clone();
        }
        if let Some(peers) = self.peers {
            config.node.peers = peers;
        }
        if let Some(addr) = self.metrics_addr {
            config.telemetry.metrics_enabled = true;
            config.telemetry.metrics_addr = addr;
        }
        if let Some(filter) = &self.log_filter {
            config.telemetry.log_filter = Some(filter.clone());
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Signing key of peer `index`, derived from the cluster key seed.
fn peer_keypair(key_seed: u64, index: usize) -> KeyPair {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&key_seed.to_le_bytes());
    seed[8..16].copy_from_slice(&(index as u64).to_le_bytes());
    KeyPair::from_seed(seed)
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Submit one no-op transaction per tick until the runner goes away.
async fn submit_blocks(
    keypair: KeyPair,
    blocks: mpsc::Sender<Block>,
    mut sequence: u64,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sequence += 1;
        let tx = Signed::sign(
            &keypair,
            Transaction {
                sequence,
                payload: TestOp::Noop.to_payload(),
            },
        );
        if blocks
            .send(Block::new(wall_clock_ms(), vec![tx]))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn run(config: ProductionConfig, thread_pools: Arc<ThreadPoolManager>) -> Result<()> {
    let telemetry = init_telemetry(&config.telemetry_config())?;

    info!(
        peers = config.node.peers,
        stake = config.node.stake,
        data_dir = %config.node.data_dir.display(),
        consensus_threads = thread_pools.config().consensus_threads,
        "Node configuration loaded"
    );

    let keypairs: Vec<KeyPair> = (0..config.node.peers)
        .map(|i| peer_keypair(config.node.key_seed, i))
        .collect();
    let genesis = TestState::genesis(
        keypairs
            .iter()
            .map(|k| (k.public_key(), config.node.stake)),
    );

    let hub = LocalHub::new();
    let node_config = config.node_config();
    let block_interval = Duration::from_millis(config.node.block_interval_ms);

    let mut shutdown_handles = Vec::with_capacity(keypairs.len());
    let mut tasks = Vec::with_capacity(keypairs.len());

    for (index, keypair) in keypairs.into_iter().enumerate() {
        let path = config.peer_data_dir(index);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let storage = RocksDbStore::open_with_config(&path, config.rocksdb_config())
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let mut runner = ProductionRunner::<TestLedger>::builder()
            .keypair(keypair.clone())
            .genesis(genesis.clone())
            .executor(Arc::new(TestLedger))
            .config(node_config)
            .thread_pools(thread_pools.clone())
            .storage(Arc::new(storage))
            .local_hub(hub.clone())
            .max_message_size(config.propagation.max_message_size)
            .build()
            .with_context(|| format!("Failed to create peer {index}"))?;

        if !block_interval.is_zero() {
            let sequence = runner
                .peer()
                .consensus_state()
                .sequences
                .get(&keypair.public_key())
                .copied()
                .unwrap_or(0);
            tokio::spawn(submit_blocks(
                keypair,
                runner.block_sender(),
                sequence,
                block_interval,
            ));
        }

        shutdown_handles.extend(runner.shutdown_handle());
        tasks.push(tokio::spawn(runner.run()));
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        drop(shutdown_handles);
    });

    telemetry.set_ready(true);
    info!(peers = tasks.len(), "Node started, press Ctrl+C to stop");

    let mut failed = 0;
    for (index, task) in tasks.into_iter().enumerate() {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(peer = index, error = %e, "Peer stopped");
                failed += 1;
            }
            Err(e) => {
                error!(peer = index, error = %e, "Peer task panicked");
                failed += 1;
            }
        }
    }

    telemetry.shutdown();
    if failed > 0 {
        bail!("{failed} peer(s) stopped with an error");
    }
    info!("Node shutdown complete");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let thread_pools = Arc::new(
        ThreadPoolManager::new(config.thread_pool_config())
            .context("Failed to initialize thread pools")?,
    );
    let runtime = thread_pools
        .build_tokio_runtime()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config, thread_pools))
}
