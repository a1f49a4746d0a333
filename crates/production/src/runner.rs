//! Production runner implementation.

use crate::metrics;
use crate::network::{decode_belief, Frame, GossipTransport, LocalHub};
use crate::propagator::{BeliefPropagator, PropagatorStats};
use crate::thread_pools::{ThreadPoolError, ThreadPoolManager};
use crate::timers::TimerManager;
use cpos_core::{Action, Event, StateMachine};
use cpos_engine::BlockExecutor;
use cpos_messages::MAX_GOSSIP_BYTES;
use cpos_node::{NodeConfig, NodeStateMachine, NodeStats};
use cpos_peer::{Peer, PeerError};
use cpos_types::{encoding, Block, ContentStore, Hash, KeyPair, PeerKey};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, span, warn, Level};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] ThreadPoolError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Checkpoint belongs to network {found}, expected {expected}")]
    NetworkMismatch { expected: Hash, found: Hash },

    #[error("Consensus stopped: {0}")]
    ConsensusStopped(String),
}

/// Handle for shutting down a running ProductionRunner.
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Snapshot of runner progress, published after every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerStatus {
    pub peer: PeerKey,
    pub consensus_point: usize,
    pub state_position: usize,
    pub halted: bool,
    pub node: NodeStats,
    pub propagation: PropagatorStats,
    /// Inbound frames that failed to decode.
    pub invalid_frames: u64,
}

/// Builder for constructing a [`ProductionRunner`].
///
/// Required fields:
/// - `keypair` - signing identity of the local peer
/// - `genesis` - genesis ledger state; a stored checkpoint must match it
/// - `executor` - block executor
/// - `storage` - content store for checkpoints
/// - `transport` or `local_hub` - gossip transport
///
/// Optional fields:
/// - `config` - node configuration (defaults to `NodeConfig::default()`)
/// - `thread_pools` - thread pool manager (defaults to auto-configured)
/// - `max_message_size` - inbound frame limit (defaults to `MAX_GOSSIP_BYTES`)
pub struct ProductionRunnerBuilder<E: BlockExecutor> {
    keypair: Option<KeyPair>,
    genesis: Option<E::State>,
    executor: Option<Arc<E>>,
    config: NodeConfig,
    thread_pools: Option<Arc<ThreadPoolManager>>,
    storage: Option<Arc<dyn ContentStore>>,
    transport: Option<(Arc<dyn GossipTransport>, mpsc::Receiver<Frame>)>,
    hub: Option<LocalHub>,
    max_message_size: usize,
}

impl<E: BlockExecutor + 'static> Default for ProductionRunnerBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BlockExecutor + 'static> ProductionRunnerBuilder<E> {
    pub fn new() -> Self {
        Self {
            keypair: None,
            genesis: None,
            executor: None,
            config: NodeConfig::default(),
            thread_pools: None,
            storage: None,
            transport: None,
            hub: None,
            max_message_size: MAX_GOSSIP_BYTES,
        }
    }

    pub fn keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn genesis(mut self, genesis: E::State) -> Self {
        self.genesis = Some(genesis);
        self
    }

    pub fn executor(mut self, executor: Arc<E>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share thread pools across runners in one process.
    pub fn thread_pools(mut self, pools: Arc<ThreadPoolManager>) -> Self {
        self.thread_pools = Some(pools);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn ContentStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a custom transport. `inbound` is the bounded queue of frames
    /// addressed to this peer.
    pub fn transport(
        mut self,
        transport: Arc<dyn GossipTransport>,
        inbound: mpsc::Receiver<Frame>,
    ) -> Self {
        self.transport = Some((transport, inbound));
        self
    }

    /// Connect to an in-process hub. The inbound queue gets the configured
    /// `queue_capacity`.
    pub fn local_hub(mut self, hub: LocalHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Build the runner, resuming from the store's checkpoint if it has one.
    pub fn build(self) -> Result<ProductionRunner<E>, RunnerError> {
        let keypair = self.keypair.ok_or(RunnerError::MissingField("keypair"))?;
        let genesis = self.genesis.ok_or(RunnerError::MissingField("genesis"))?;
        let executor = self.executor.ok_or(RunnerError::MissingField("executor"))?;
        let storage = self.storage.ok_or(RunnerError::MissingField("storage"))?;
        let thread_pools = match self.thread_pools {
            Some(pools) => pools,
            None => Arc::new(ThreadPoolManager::auto()?),
        };

        let network_id = encoding::hash_value(&genesis);
        let peer = match Peer::restore(storage.as_ref(), keypair.clone(), self.config.peer)? {
            Some(peer) if peer.network_id() != network_id => {
                return Err(RunnerError::NetworkMismatch {
                    expected: network_id,
                    found: peer.network_id(),
                });
            }
            Some(peer) => {
                info!(
                    peer = %peer.peer_key(),
                    state_position = peer.state_position(),
                    "Resuming from checkpoint"
                );
                peer
            }
            None => {
                info!(peer = %keypair.public_key(), network = %network_id, "Starting from genesis");
                Peer::create(keypair, genesis, self.config.peer)
            }
        };

        let (transport, inbound_rx) = match (self.transport, self.hub) {
            (Some(transport), _) => transport,
            (None, Some(hub)) => {
                let (transport, inbound) =
                    hub.connect(peer.peer_key(), self.config.propagation.queue_capacity);
                (Arc::new(transport) as Arc<dyn GossipTransport>, inbound)
            }
            (None, None) => return Err(RunnerError::MissingField("transport")),
        };

        let (timer_tx, timer_rx) = mpsc::channel(16);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (block_tx, block_rx) = mpsc::channel(self.config.propagation.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let state = NodeStateMachine::new(0, peer, executor, self.config);
        let (status_tx, _) = watch::channel(status_of(&state, PropagatorStats::default(), 0));

        Ok(ProductionRunner {
            state,
            thread_pools,
            storage,
            propagator: BeliefPropagator::new(transport),
            timer_manager: TimerManager::new(timer_tx),
            timer_rx,
            callback_tx,
            callback_rx,
            inbound_rx,
            block_tx,
            block_rx,
            max_message_size: self.max_message_size,
            invalid_frames: 0,
            stopped: None,
            status_tx,
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

/// Production runner with async I/O.
///
/// A single task owns the node state machine. Inbound beliefs arrive on a
/// bounded queue; whatever is queued when the runner gets to it is merged
/// in one batch. Every transition runs inside the consensus pool.
pub struct ProductionRunner<E: BlockExecutor> {
    state: NodeStateMachine<E>,
    thread_pools: Arc<ThreadPoolManager>,
    storage: Arc<dyn ContentStore>,
    propagator: BeliefPropagator,
    timer_manager: TimerManager,
    /// Timer events have their own channel so gossip floods cannot delay them.
    timer_rx: mpsc::Receiver<Event>,
    /// Storage callbacks.
    callback_tx: mpsc::UnboundedSender<Event>,
    callback_rx: mpsc::UnboundedReceiver<Event>,
    inbound_rx: mpsc::Receiver<Frame>,
    block_tx: mpsc::Sender<Block>,
    block_rx: mpsc::Receiver<Block>,
    max_message_size: usize,
    invalid_frames: u64,
    /// Reason consensus stopped, set by `Action::StopConsensus`.
    stopped: Option<String>,
    status_tx: watch::Sender<RunnerStatus>,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

fn status_of<E: BlockExecutor>(
    state: &NodeStateMachine<E>,
    propagation: PropagatorStats,
    invalid_frames: u64,
) -> RunnerStatus {
    RunnerStatus {
        peer: state.peer().peer_key(),
        consensus_point: state.peer().finality_point(),
        state_position: state.peer().state_position(),
        halted: state.is_halted(),
        node: state.stats(),
        propagation,
        invalid_frames,
    }
}

/// Wall-clock time since the Unix epoch, the node's logical clock.
fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

impl<E: BlockExecutor + 'static> ProductionRunner<E> {
    pub fn builder() -> ProductionRunnerBuilder<E> {
        ProductionRunnerBuilder::new()
    }

    pub fn peer(&self) -> &Peer<E::State> {
        self.state.peer()
    }

    pub fn thread_pools(&self) -> &Arc<ThreadPoolManager> {
        &self.thread_pools
    }

    /// Sender for blocks this peer should propose.
    pub fn block_sender(&self) -> mpsc::Sender<Block> {
        self.block_tx.clone()
    }

    /// Watch progress while the runner is running.
    pub fn status(&self) -> watch::Receiver<RunnerStatus> {
        self.status_tx.subscribe()
    }

    /// Take the shutdown handle.
    ///
    /// Returns a handle that when dropped triggers graceful shutdown.
    /// Can only be called once; subsequent calls return None.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the event loop until shutdown or until consensus stops.
    ///
    /// # Priority Handling
    ///
    /// Uses a `biased` select: shutdown, timers, storage callbacks, inbound
    /// beliefs, submitted blocks, then the metrics tick.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        let config = self.thread_pools.config();
        info!(
            peer = %self.state.peer().peer_key(),
            state_position = self.state.peer().state_position(),
            consensus_threads = config.consensus_threads,
            queue_capacity = self.state.config().propagation.queue_capacity,
            "Starting production runner"
        );

        self.state.set_time(wall_clock());
        let actions = self.state.initialize();
        self.process_actions(actions);
        self.publish_status();

        let mut metrics_tick = tokio::time::interval(Duration::from_secs(1));
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if let Some(reason) = self.stopped.take() {
                self.timer_manager.cancel_all();
                return Err(RunnerError::ConsensusStopped(reason));
            }

            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    let event_span = span!(Level::DEBUG, "handle_timer", event.type = %event.type_name());
                    let _guard = event_span.enter();
                    self.dispatch(event);
                }

                Some(event) = self.callback_rx.recv() => {
                    self.dispatch(event);
                }

                Some(frame) = self.inbound_rx.recv() => {
                    let event_span = span!(Level::DEBUG, "handle_beliefs");
                    let _guard = event_span.enter();
                    self.on_inbound(frame);
                }

                Some(block) = self.block_rx.recv() => {
                    metrics::record_block_submitted();
                    self.dispatch(Event::BlockSubmitted { block });
                }

                _ = metrics_tick.tick() => {
                    let peer = self.state.peer();
                    metrics::set_consensus_progress(peer.finality_point(), peer.state_position());
                }
            }
        }

        self.timer_manager.cancel_all();
        info!(
            state_position = self.state.peer().state_position(),
            "Production runner stopped"
        );
        Ok(())
    }

    /// Drain the inbound queue and merge everything in one batch.
    fn on_inbound(&mut self, first: Frame) {
        let capacity = self.state.config().propagation.queue_capacity.max(1);
        let mut frames = vec![first];
        while frames.len() < capacity {
            match self.inbound_rx.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }

        let mut beliefs = Vec::with_capacity(frames.len());
        for frame in frames {
            match decode_belief(&frame, self.max_message_size) {
                Ok(gossip) => beliefs.push(gossip),
                Err(e) => {
                    self.invalid_frames += 1;
                    metrics::record_invalid_message();
                    warn!(error = %e, size = frame.len(), "Dropping undecodable gossip");
                }
            }
        }
        if beliefs.is_empty() {
            self.publish_status();
            return;
        }

        let batch = beliefs.len();
        let start = Instant::now();
        self.dispatch(Event::BeliefsReceived { beliefs });
        metrics::record_merge(batch, start.elapsed().as_secs_f64());
    }

    /// Feed one event to the state machine and execute the resulting actions.
    fn dispatch(&mut self, event: Event) {
        self.state.set_time(wall_clock());
        let before = self.state.stats();

        let state = &mut self.state;
        let actions = self.thread_pools.in_consensus_pool(|| state.handle(event));

        metrics::record_node_stats(&before, &self.state.stats());
        self.process_actions(actions);
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(status_of(
            &self.state,
            self.propagator.stats(),
            self.invalid_frames,
        ));
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.process_action(action);
        }
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => {
                if let Err(e) = self.propagator.broadcast(&message) {
                    error!(error = %e, "Failed to encode outbound message");
                }
            }

            Action::SetTimer { id, duration } => {
                self.timer_manager.set_timer(id, duration);
            }

            Action::CancelTimer { id } => {
                self.timer_manager.cancel_timer(id);
            }

            Action::PersistCheckpoint => self.persist_checkpoint(),

            Action::ConsensusAdvanced {
                consensus_point,
                state_position,
            } => {
                metrics::set_consensus_progress(consensus_point, state_position);
            }

            Action::StopConsensus { reason } => {
                error!(%reason, "Consensus stopped, node needs intervention");
                metrics::set_consensus_stopped(true);
                self.stopped = Some(reason);
            }
        }
    }

    /// Write a checkpoint synchronously. A failure is logged and counted;
    /// the next advancement writes a fresh one.
    fn persist_checkpoint(&mut self) {
        let peer = self.state.peer();
        match peer.persist(self.storage.as_ref()) {
            Ok(root) => {
                metrics::record_checkpoint_written();
                debug!(root = %root, state_position = peer.state_position(), "Checkpoint written");
                let _ = self.callback_tx.send(Event::CheckpointPersisted {
                    root,
                    state_position: peer.state_position(),
                });
            }
            Err(e) => {
                metrics::record_checkpoint_failure();
                warn!(error = %e, "Failed to persist checkpoint");
            }
        }
    }
}
