//! End-to-end tests for the production runner.
//!
//! Peers run as real tokio tasks, gossip over an in-process hub and keep
//! checkpoints in either memory or RocksDB.

use cpos_engine::test_utils::{TestLedger, TestOp, TestState};
use cpos_node::NodeConfig;
use cpos_production::network::{GossipTransport, LocalHub};
use cpos_production::{
    ProductionRunner, RocksDbStore, RunnerError, RunnerStatus, ThreadPoolConfig,
    ThreadPoolManager,
};
use cpos_types::test_utils::{test_keypair, test_transaction};
use cpos_types::{Block, ContentStore, KeyPair, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CONSENSUS_TIMEOUT: Duration = Duration::from_secs(20);

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn thread_pools() -> Arc<ThreadPoolManager> {
    Arc::new(ThreadPoolManager::new(ThreadPoolConfig::minimal()).unwrap())
}

fn genesis(keys: &[KeyPair]) -> TestState {
    TestState::genesis(keys.iter().map(|k| (k.public_key(), 100)))
}

fn build_runner(
    keypair: &KeyPair,
    genesis: &TestState,
    storage: Arc<dyn ContentStore>,
    hub: &LocalHub,
    pools: &Arc<ThreadPoolManager>,
) -> Result<ProductionRunner<TestLedger>, RunnerError> {
    ProductionRunner::<TestLedger>::builder()
        .keypair(keypair.clone())
        .genesis(genesis.clone())
        .executor(Arc::new(TestLedger))
        .config(NodeConfig::default())
        .thread_pools(pools.clone())
        .storage(storage)
        .local_hub(hub.clone())
        .build()
}

fn noop_block(keypair: &KeyPair, sequence: u64, timestamp: u64) -> Block {
    Block::new(
        timestamp,
        vec![test_transaction(keypair, sequence, &TestOp::Noop.to_payload())],
    )
}

async fn wait_for_position(status: &mut watch::Receiver<RunnerStatus>, position: usize) {
    timeout(
        CONSENSUS_TIMEOUT,
        status.wait_for(|s| s.state_position >= position),
    )
    .await
    .expect("timed out waiting for consensus")
    .expect("runner status channel closed");
}

struct Running {
    status: watch::Receiver<RunnerStatus>,
    shutdown: cpos_production::ShutdownHandle,
    task: JoinHandle<Result<(), RunnerError>>,
}

fn spawn(mut runner: ProductionRunner<TestLedger>) -> Running {
    let status = runner.status();
    let shutdown = runner.shutdown_handle().unwrap();
    let task = tokio::spawn(runner.run());
    Running {
        status,
        shutdown,
        task,
    }
}

impl Running {
    async fn stop(self) -> Result<(), RunnerError> {
        self.shutdown.shutdown();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("runner did not stop")
            .expect("runner task panicked")
    }
}

// ============================================================================
// Consensus
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_peers_agree_on_submitted_blocks() {
    init_logging();

    let keys: Vec<_> = (1..=3).map(test_keypair).collect();
    let genesis = genesis(&keys);
    let hub = LocalHub::new();
    let pools = thread_pools();

    let mut peers = Vec::new();
    let mut senders = Vec::new();
    for key in &keys {
        let runner =
            build_runner(key, &genesis, Arc::new(MemoryStore::new()), &hub, &pools).unwrap();
        senders.push(runner.block_sender());
        peers.push(spawn(runner));
    }
    assert_eq!(hub.len(), 3);

    for (i, (key, sender)) in keys.iter().zip(&senders).enumerate() {
        sender
            .send(noop_block(key, 1, 1_000 + i as u64))
            .await
            .unwrap();
    }

    for peer in &mut peers {
        wait_for_position(&mut peer.status, 3).await;
    }

    for peer in peers {
        let status = *peer.status.borrow();
        assert!(!status.halted);
        assert!(status.node.merges > 0);
        assert!(status.propagation.broadcasts > 0);
        assert_eq!(status.node.forks, 0);
        peer.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_resumes_from_rocksdb_checkpoint() {
    init_logging();

    let keys: Vec<_> = (1..=2).map(test_keypair).collect();
    let genesis = genesis(&keys);
    let dirs: Vec<TempDir> = keys.iter().map(|_| TempDir::new().unwrap()).collect();
    let pools = thread_pools();

    let reached = {
        let hub = LocalHub::new();
        let mut peers = Vec::new();
        let mut senders = Vec::new();
        for (key, dir) in keys.iter().zip(&dirs) {
            let store = Arc::new(RocksDbStore::open(dir.path()).unwrap());
            let runner = build_runner(key, &genesis, store, &hub, &pools).unwrap();
            senders.push(runner.block_sender());
            peers.push(spawn(runner));
        }

        senders[0].send(noop_block(&keys[0], 1, 5_000)).await.unwrap();
        for peer in &mut peers {
            wait_for_position(&mut peer.status, 1).await;
        }

        let reached = peers[0].status.borrow().state_position;
        for peer in peers {
            peer.stop().await.unwrap();
        }
        reached
    };

    let store = Arc::new(RocksDbStore::open(dirs[0].path()).unwrap());
    let runner = build_runner(&keys[0], &genesis, store, &LocalHub::new(), &pools).unwrap();
    assert!(runner.peer().state_position() >= 1);
    assert!(runner.peer().state_position() <= reached);
    assert_eq!(
        runner
            .peer()
            .consensus_state()
            .sequences
            .get(&keys[0].public_key()),
        Some(&1)
    );
}

#[tokio::test]
async fn test_checkpoint_from_other_network_rejected() {
    let keys: Vec<_> = (1..=2).map(test_keypair).collect();
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ContentStore> = Arc::new(RocksDbStore::open(dir.path()).unwrap());
    let pools = thread_pools();

    let peer = cpos_peer::Peer::create(keys[0].clone(), genesis(&keys), Default::default());
    peer.persist(store.as_ref()).unwrap();

    let other_genesis = TestState::genesis([(keys[0].public_key(), 1)]);
    let err = build_runner(&keys[0], &other_genesis, store, &LocalHub::new(), &pools)
        .err()
        .unwrap();
    assert!(matches!(err, RunnerError::NetworkMismatch { .. }));
}

// ============================================================================
// Boundary behavior
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undecodable_gossip_is_counted_and_ignored() {
    init_logging();

    let keys = [test_keypair(1), test_keypair(2)];
    let hub = LocalHub::new();
    let runner = build_runner(
        &keys[0],
        &genesis(&keys),
        Arc::new(MemoryStore::new()),
        &hub,
        &thread_pools(),
    )
    .unwrap();
    let mut peer = spawn(runner);

    let (intruder, _inbox) = hub.connect(keys[1].public_key(), 4);
    let delivery = intruder.broadcast(vec![0xFF, 0x00, 0x13].into());
    assert_eq!(delivery.delivered, 1);

    timeout(
        Duration::from_secs(5),
        peer.status.wait_for(|s| s.invalid_frames == 1),
    )
    .await
    .unwrap()
    .unwrap();

    let status = *peer.status.borrow();
    assert!(!status.halted);
    assert_eq!(status.node.merges, 0);
    peer.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_handle_stops_runner() {
    let keys = [test_keypair(1)];
    let runner = build_runner(
        &keys[0],
        &genesis(&keys),
        Arc::new(MemoryStore::new()),
        &LocalHub::new(),
        &thread_pools(),
    )
    .unwrap();
    let peer = spawn(runner);
    assert!(peer.stop().await.is_ok());
}

#[tokio::test]
async fn test_dropping_shutdown_handle_stops_runner() {
    let keys = [test_keypair(1)];
    let mut runner = build_runner(
        &keys[0],
        &genesis(&keys),
        Arc::new(MemoryStore::new()),
        &LocalHub::new(),
        &thread_pools(),
    )
    .unwrap();
    let handle = runner.shutdown_handle().unwrap();
    assert!(runner.shutdown_handle().is_none());

    let task = tokio::spawn(runner.run());
    drop(handle);
    let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_builder_requires_transport() {
    let keys = [test_keypair(1)];
    let err = ProductionRunner::<TestLedger>::builder()
        .keypair(keys[0].clone())
        .genesis(genesis(&keys))
        .executor(Arc::new(TestLedger))
        .storage(Arc::new(MemoryStore::new()))
        .thread_pools(thread_pools())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, RunnerError::MissingField("transport")));
}
