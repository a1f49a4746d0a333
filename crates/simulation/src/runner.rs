//! Deterministic simulation runner.
//!
//! Each node has its own checkpoint store. All nodes share one stateless
//! `TestLedger` executor, applied inline while a node handles an event.

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use cpos_core::{Action, Event, OutboundMessage, StateMachine, TimerId};
use cpos_engine::test_utils::{TestLedger, TestOp, TestState};
use cpos_node::{NodeConfig, NodeIndex, NodeStateMachine};
use cpos_peer::{Peer, PeerError};
use cpos_types::{Block, KeyPair, MemoryStore, SignedTransaction, Signed, Transaction};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Simulation setup.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub network: NetworkConfig,
    /// Genesis stake per node. Its length overrides `network.num_nodes`.
    pub stakes: Vec<u64>,
    pub node: NodeConfig,
}

impl SimulationConfig {
    /// Network of `stakes.len()` nodes with default latency and node settings.
    pub fn with_stakes(stakes: Vec<u64>) -> Self {
        Self {
            network: NetworkConfig {
                num_nodes: stakes.len() as u32,
                ..NetworkConfig::default()
            },
            stakes,
            node: NodeConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::with_stakes(vec![100; 4])
    }
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    /// All nodes in the simulation, indexed by NodeIndex.
    nodes: Vec<NodeStateMachine<TestLedger>>,

    keys: Vec<KeyPair>,

    genesis: TestState,

    config: SimulationConfig,

    executor: Arc<TestLedger>,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Timer registry for cancellation support.
    /// Maps (node, timer_id) -> event_key for removal.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    /// Per-node checkpoint store.
    node_storage: Vec<Arc<MemoryStore>>,

    /// Last transaction sequence number used per node.
    tx_sequence: Vec<u64>,

    /// Reasons reported through `Action::StopConsensus`, per node.
    stopped: BTreeMap<NodeIndex, String>,

    stats: SimulationStats,
}

impl SimulationRunner {
    /// Create a runner with one node per entry of `config.stakes`.
    pub fn new(mut config: SimulationConfig, seed: u64) -> Self {
        config.network.num_nodes = config.stakes.len() as u32;
        let num_nodes = config.network.num_nodes;

        let keys: Vec<KeyPair> = (0..num_nodes).map(|i| node_keypair(seed, i)).collect();
        let genesis = TestState::genesis(
            keys.iter()
                .zip(&config.stakes)
                .map(|(k, stake)| (k.public_key(), *stake)),
        );
        let executor = Arc::new(TestLedger);

        let nodes = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let peer = Peer::create(key.clone(), genesis.clone(), config.node.peer);
                NodeStateMachine::new(i as NodeIndex, peer, Arc::clone(&executor), config.node)
            })
            .collect();

        info!(num_nodes, seed, "Created simulation runner");

        Self {
            nodes,
            keys,
            genesis,
            network: SimulatedNetwork::new(config.network.clone()),
            config,
            executor,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            node_storage: (0..num_nodes).map(|_| Arc::new(MemoryStore::new())).collect(),
            tx_sequence: vec![0; num_nodes as usize],
            stopped: BTreeMap::new(),
            stats: SimulationStats::default(),
        }
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn node(&self, index: NodeIndex) -> Option<&NodeStateMachine<TestLedger>> {
        self.nodes.get(index as usize)
    }

    pub fn nodes(&self) -> &[NodeStateMachine<TestLedger>] {
        &self.nodes
    }

    pub fn keypair(&self, index: NodeIndex) -> Option<&KeyPair> {
        self.keys.get(index as usize)
    }

    pub fn genesis(&self) -> &TestState {
        &self.genesis
    }

    pub fn node_storage(&self, index: NodeIndex) -> Option<&MemoryStore> {
        self.node_storage.get(index as usize).map(Arc::as_ref)
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Get a mutable reference to the network for partition/loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Nodes that stopped consensus, with the reported reason.
    pub fn stopped_nodes(&self) -> &BTreeMap<NodeIndex, String> {
        &self.stopped
    }

    /// Start timers and initial broadcasts on every node.
    pub fn initialize(&mut self) {
        for index in 0..self.nodes.len() {
            self.initialize_node(index as NodeIndex);
        }
    }

    fn initialize_node(&mut self, index: NodeIndex) {
        let node = &mut self.nodes[index as usize];
        node.set_time(self.now);
        let actions = node.initialize();
        for action in actions {
            self.process_action(index, action);
        }
    }

    /// Schedule an event for `node` after `delay`.
    pub fn schedule_initial_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let time = self.now + delay;
        self.schedule_event(node, time, event);
    }

    /// Schedule a block with one no-op transaction from `node`'s own key.
    pub fn submit_block(&mut self, node: NodeIndex, delay: Duration) {
        let sequence = {
            let counter = &mut self.tx_sequence[node as usize];
            *counter += 1;
            *counter
        };
        let keypair = &self.keys[node as usize];
        let tx: SignedTransaction = Signed::sign(
            keypair,
            Transaction {
                sequence,
                payload: TestOp::Noop.to_payload(),
            },
        );
        let timestamp = (self.now + delay).as_millis() as u64;
        self.schedule_initial_event(
            node,
            delay,
            Event::BlockSubmitted {
                block: Block::new(timestamp, vec![tx]),
            },
        );
    }

    /// Simulate a crash followed by a restart from the node's last checkpoint.
    ///
    /// Pending events and timers of the node are discarded. Without a
    /// checkpoint the node restarts from genesis.
    pub fn restart_node(&mut self, index: NodeIndex) -> Result<(), PeerError> {
        self.event_queue.retain(|key, _| key.node_index != index);
        self.timers.retain(|(node, _), _| *node != index);

        let keypair = self.keys[index as usize].clone();
        let store = Arc::clone(&self.node_storage[index as usize]);
        let peer = match Peer::restore(store.as_ref(), keypair.clone(), self.config.node.peer)? {
            Some(peer) => peer,
            None => Peer::create(keypair, self.genesis.clone(), self.config.node.peer),
        };
        info!(
            node = index,
            state_position = peer.state_position(),
            "Restarting node"
        );
        self.nodes[index as usize] = NodeStateMachine::new(
            index,
            peer,
            Arc::clone(&self.executor),
            self.config.node,
        );
        self.initialize_node(index);
        Ok(())
    }

    /// Run simulation until no more events or time limit reached.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );

        while let Some((key, event)) = self.event_queue.pop_first() {
            if key.time > end_time {
                self.event_queue.insert(key, event);
                debug!(
                    remaining_events = self.event_queue.len(),
                    "Time limit reached"
                );
                break;
            }
            self.now = key.time;
            let node_index = key.node_index;
            if let Some(id) = fired_timer(&event) {
                self.timers.remove(&(node_index, id));
            }

            trace!(time = ?self.now, node = node_index, event = event.type_name(), "Processing event");

            self.stats.events_processed += 1;
            self.stats.events_by_priority[event.priority() as usize] += 1;

            let node = &mut self.nodes[node_index as usize];
            node.set_time(self.now);
            let actions = node.handle(event);

            self.stats.actions_generated += actions.len() as u64;
            for action in actions {
                self.process_action(node_index, action);
            }
        }
        self.now = self.now.max(end_time);
    }

    /// Process an action from a node.
    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in self.network.all_nodes() {
                    if to != from {
                        let event = message_to_event(message.clone());
                        self.try_deliver_message(from, to, event);
                    }
                }
            }

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let fire_time = self.now + duration;
                let key = self.schedule_event(from, fire_time, timer_to_event(id));
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::PersistCheckpoint => {
                let store = Arc::clone(&self.node_storage[from as usize]);
                let peer = self.nodes[from as usize].peer();
                match peer.persist(store.as_ref()) {
                    Ok(root) => {
                        self.stats.checkpoints_written += 1;
                        let event = Event::CheckpointPersisted {
                            root,
                            state_position: peer.state_position(),
                        };
                        self.schedule_event(from, self.now, event);
                    }
                    Err(e) => {
                        self.stats.checkpoint_failures += 1;
                        warn!(node = from, error = %e, "Checkpoint failed");
                    }
                }
            }

            Action::ConsensusAdvanced {
                consensus_point,
                state_position,
            } => {
                debug!(node = from, consensus_point, state_position, "Consensus advanced");
            }

            Action::StopConsensus { reason } => {
                warn!(node = from, reason = %reason, "Node stopped consensus");
                self.stopped.insert(from, reason);
            }
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Deliver a broadcast over one link unless it is cut or loses it.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, event: Event) {
        if self.network.is_cut(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from, to, "Message dropped due to partition");
            return;
        }
        if self.network.drops_delivery(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from, to, "Message dropped due to packet loss");
            return;
        }
        let latency = self.network.delivery_delay(&mut self.rng);
        self.schedule_event(to, self.now + latency, event);
        self.stats.messages_sent += 1;
    }
}

fn message_to_event(message: OutboundMessage) -> Event {
    match message {
        OutboundMessage::Belief(gossip) => Event::BeliefsReceived {
            beliefs: vec![*gossip],
        },
    }
}

fn fired_timer(event: &Event) -> Option<TimerId> {
    match event {
        Event::BroadcastTimer => Some(TimerId::Broadcast),
        Event::CleanupTimer => Some(TimerId::Cleanup),
        _ => None,
    }
}

fn timer_to_event(id: TimerId) -> Event {
    match id {
        TimerId::Broadcast => Event::BroadcastTimer,
        TimerId::Cleanup => Event::CleanupTimer,
    }
}

/// Deterministic key for simulated node `index`.
fn node_keypair(seed: u64, index: u32) -> KeyPair {
    let mut seed_bytes = [0u8; 32];
    let key_seed = seed
        .wrapping_add(u64::from(index))
        .wrapping_mul(0x517cc1b727220a95);
    seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
    seed_bytes[8..16].copy_from_slice(&u64::from(index).to_le_bytes());
    KeyPair::from_seed(seed_bytes)
}
