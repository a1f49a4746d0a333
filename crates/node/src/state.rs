//! Node state machine.

use crate::NodeConfig;
use cpos_belief::Belief;
use cpos_core::{Action, Event, OutboundMessage, StateMachine, TimerId};
use cpos_engine::BlockExecutor;
use cpos_messages::BeliefGossip;
use cpos_peer::{Peer, PeerError};
use cpos_types::{Block, Hash, Timestamp};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Index type for simulation-only node routing.
/// Production identifies peers by their `PeerKey`.
pub type NodeIndex = u32;

/// Counters for anomalies and propagation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub merges: u64,
    pub broadcasts: u64,
    pub rebroadcasts: u64,
    /// Beliefs from another network, dropped before merge.
    pub foreign_beliefs: u64,
    /// Merges after which the own consensus point was lower than before.
    pub receding_finality: u64,
    /// State advancements that rolled back applied history.
    pub forks: u64,
    /// Submitted blocks dropped for lack of stake.
    pub rejected_blocks: u64,
    pub checkpoints: u64,
}

/// Combined node state machine.
///
/// Owns the peer and serializes its transitions. Merge and state
/// advancement run synchronously inside `handle`; broadcasting is
/// rate-limited and only happens when the own order changed, apart from the
/// periodic rebroadcast.
pub struct NodeStateMachine<E: BlockExecutor> {
    /// This node's index (simulation-only, for routing).
    node_index: NodeIndex,

    executor: Arc<E>,

    peer: Peer<E::State>,

    config: NodeConfig,

    network_id: Hash,

    /// Current time.
    now: Duration,

    last_broadcast: Option<Duration>,

    /// Hash of the own signed order at the last broadcast.
    last_broadcast_order: Option<Hash>,

    /// Set once a fatal error stopped consensus.
    halted: Option<String>,

    stats: NodeStats,
}

impl<E: BlockExecutor> fmt::Debug for NodeStateMachine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("node_index", &self.node_index)
            .field("peer", &self.peer)
            .field("now", &self.now)
            .field("halted", &self.halted)
            .finish()
    }
}

impl<E: BlockExecutor> NodeStateMachine<E> {
    /// Create a node around an existing peer, fresh or restored.
    pub fn new(
        node_index: NodeIndex,
        peer: Peer<E::State>,
        executor: Arc<E>,
        config: NodeConfig,
    ) -> Self {
        let network_id = peer.network_id();
        Self {
            node_index,
            executor,
            peer,
            config,
            network_id,
            now: Duration::ZERO,
            last_broadcast: None,
            last_broadcast_order: None,
            halted: None,
            stats: NodeStats::default(),
        }
    }

    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn peer(&self) -> &Peer<E::State> {
        &self.peer
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network_id(&self) -> Hash {
        self.network_id
    }

    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Start timers and announce the initial belief.
    pub fn initialize(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Cleanup,
            duration: self.config.cleanup_interval,
        }];
        actions.extend(self.broadcast(false));
        actions
    }

    fn logical_time(&self) -> Timestamp {
        self.now.as_millis() as Timestamp
    }

    fn own_order_hash(&self) -> Option<Hash> {
        self.peer
            .belief()
            .signed_order(&self.peer.peer_key())
            .map(|signed| signed.hash())
    }

    /// Stop consensus after a fatal error.
    fn halt(&mut self, err: PeerError) -> Vec<Action> {
        if !err.is_fatal() {
            warn!(error = %err, "Recoverable peer error");
            return vec![];
        }
        error!(node = self.node_index, error = %err, "Stopping consensus");
        let reason = err.to_string();
        self.halted = Some(reason.clone());
        vec![
            Action::CancelTimer {
                id: TimerId::Broadcast,
            },
            Action::CancelTimer {
                id: TimerId::Cleanup,
            },
            Action::StopConsensus { reason },
        ]
    }

    fn on_beliefs_received(&mut self, gossip: Vec<BeliefGossip>) -> Vec<Action> {
        let mut beliefs = Vec::with_capacity(gossip.len());
        for message in gossip {
            if message.network_id != self.network_id {
                self.stats.foreign_beliefs += 1;
                debug!(sender = %message.sender, "Dropping belief from another network");
                continue;
            }
            beliefs.push(Some(message.into_belief()));
        }
        if beliefs.is_empty() {
            return vec![];
        }
        self.merge_and_advance(&beliefs)
    }

    fn merge_and_advance(&mut self, beliefs: &[Option<Belief>]) -> Vec<Action> {
        let old_finality = self.peer.finality_point();
        let old_position = self.peer.state_position();
        let old_consensus = self.peer.consensus_order().clone();

        let merged = match self
            .peer
            .update_timestamp(self.logical_time())
            .merge_beliefs(self.executor.as_ref(), beliefs)
        {
            Ok(peer) => peer,
            Err(e) => return self.halt(e),
        };
        self.stats.merges += 1;
        if merged.finality_point() < old_finality {
            self.stats.receding_finality += 1;
        }

        let advanced = match merged.update_state(self.executor.as_ref()) {
            Ok(peer) => peer,
            Err(e) => return self.halt(e),
        };
        if advanced.consensus_order().common_prefix_length(&old_consensus) < old_position {
            self.stats.forks += 1;
        }
        self.peer = advanced;

        let mut actions = Vec::new();
        if self.peer.state_position() != old_position {
            info!(
                node = self.node_index,
                consensus_point = self.peer.finality_point(),
                state_position = self.peer.state_position(),
                "Consensus advanced"
            );
            actions.push(Action::ConsensusAdvanced {
                consensus_point: self.peer.finality_point(),
                state_position: self.peer.state_position(),
            });
            actions.push(Action::PersistCheckpoint);
        }
        actions.extend(self.maybe_broadcast());
        actions
    }

    fn on_block_submitted(&mut self, block: Block) -> Vec<Action> {
        if !self
            .peer
            .is_ready_to_publish(self.executor.as_ref(), self.config.min_publish_stake)
        {
            self.stats.rejected_blocks += 1;
            warn!(node = self.node_index, "Not enough stake to propose, dropping block");
            return vec![];
        }
        self.peer = self
            .peer
            .update_timestamp(self.logical_time())
            .propose_block(block);
        self.maybe_broadcast()
    }

    /// Broadcast now if the own order changed and the minimum delay has
    /// passed, otherwise arm the broadcast timer for when it will have.
    fn maybe_broadcast(&mut self) -> Vec<Action> {
        if self.own_order_hash() == self.last_broadcast_order {
            return vec![];
        }
        match self.broadcast_wait() {
            Duration::ZERO => self.broadcast(false),
            remaining => vec![Action::SetTimer {
                id: TimerId::Broadcast,
                duration: remaining,
            }],
        }
    }

    fn broadcast_wait(&self) -> Duration {
        match self.last_broadcast {
            Some(last) => (last + self.config.propagation.min_broadcast_delay).saturating_sub(self.now),
            None => Duration::ZERO,
        }
    }

    fn on_broadcast_timer(&mut self) -> Vec<Action> {
        if self.own_order_hash() != self.last_broadcast_order {
            let remaining = self.broadcast_wait();
            if remaining.is_zero() {
                return self.broadcast(false);
            }
            return vec![Action::SetTimer {
                id: TimerId::Broadcast,
                duration: remaining,
            }];
        }

        let rebroadcast_at = self.last_broadcast.unwrap_or(Duration::ZERO)
            + self.config.propagation.rebroadcast_delay;
        if self.now >= rebroadcast_at {
            return self.broadcast(true);
        }
        vec![Action::SetTimer {
            id: TimerId::Broadcast,
            duration: rebroadcast_at - self.now,
        }]
    }

    fn broadcast(&mut self, repeat: bool) -> Vec<Action> {
        let gossip = BeliefGossip::new(
            self.network_id,
            self.peer.peer_key(),
            self.peer.belief().clone(),
        );
        self.last_broadcast = Some(self.now);
        self.last_broadcast_order = self.own_order_hash();
        self.stats.broadcasts += 1;
        if repeat {
            self.stats.rebroadcasts += 1;
        }
        debug!(
            node = self.node_index,
            orders = self.peer.belief().len(),
            repeat,
            "Broadcasting belief"
        );
        vec![
            Action::Broadcast {
                message: OutboundMessage::Belief(Box::new(gossip)),
            },
            Action::SetTimer {
                id: TimerId::Broadcast,
                duration: self.config.propagation.rebroadcast_delay,
            },
        ]
    }

    fn on_cleanup_timer(&mut self) -> Vec<Action> {
        let cutoff = self
            .now
            .saturating_sub(self.config.history_retention)
            .as_millis() as Timestamp;
        self.peer = self.peer.prune_history(cutoff);
        vec![Action::SetTimer {
            id: TimerId::Cleanup,
            duration: self.config.cleanup_interval,
        }]
    }
}

impl<E: BlockExecutor> StateMachine for NodeStateMachine<E> {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.halted.is_some() {
            return vec![];
        }
        match event {
            Event::BroadcastTimer => self.on_broadcast_timer(),
            Event::CleanupTimer => self.on_cleanup_timer(),
            Event::BeliefsReceived { beliefs } => self.on_beliefs_received(beliefs),
            Event::BlockSubmitted { block } => self.on_block_submitted(block),
            Event::CheckpointPersisted {
                root,
                state_position,
            } => {
                self.stats.checkpoints += 1;
                debug!(node = self.node_index, root = %root, state_position, "Checkpoint persisted");
                vec![]
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpos_engine::test_utils::{TestLedger, TestOp, TestState};
    use cpos_peer::PeerConfig;
    use cpos_types::test_utils::{test_keypair, test_order, test_transaction};
    use cpos_types::{KeyPair, Signed};
    use tracing_test::traced_test;

    fn node(index: u8, genesis: &TestState) -> NodeStateMachine<TestLedger> {
        let peer = Peer::create(test_keypair(index), genesis.clone(), PeerConfig::default());
        NodeStateMachine::new(u32::from(index), peer, Arc::new(TestLedger), NodeConfig::default())
    }

    fn genesis(keys: &[KeyPair]) -> TestState {
        TestState::genesis(keys.iter().map(|k| (k.public_key(), 100)))
    }

    fn broadcasts(actions: &[Action]) -> Vec<BeliefGossip> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::Belief(gossip),
                } => Some(gossip.as_ref().clone()),
                _ => None,
            })
            .collect()
    }

    fn submit(node: &mut NodeStateMachine<TestLedger>, keypair: &KeyPair, at: u64) -> Vec<Action> {
        node.set_time(Duration::from_millis(at));
        let tx = test_transaction(keypair, 1, &TestOp::Noop.to_payload());
        node.handle(Event::BlockSubmitted {
            block: Block::new(at, vec![tx]),
        })
    }

    #[test]
    fn test_initialize_broadcasts_and_arms_timers() {
        let keys = [test_keypair(1)];
        let mut node = node(1, &genesis(&keys));
        let actions = node.initialize();
        assert_eq!(broadcasts(&actions).len(), 1);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Cleanup,
                ..
            }
        )));
        assert_eq!(node.stats().broadcasts, 1);
    }

    #[test]
    fn test_broadcast_is_rate_limited() {
        let keys = [test_keypair(1)];
        let mut node = node(1, &genesis(&keys));
        node.initialize();

        // Within the minimum delay: deferred to the timer.
        let actions = submit(&mut node, &keys[0], 10);
        assert!(broadcasts(&actions).is_empty());
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Broadcast,
                duration
            } if *duration == Duration::from_millis(40)
        )));

        node.set_time(Duration::from_millis(50));
        let actions = node.handle(Event::BroadcastTimer);
        assert_eq!(broadcasts(&actions).len(), 1);
        assert_eq!(node.stats().broadcasts, 2);
    }

    #[test]
    fn test_unchanged_belief_is_only_rebroadcast_periodically() {
        let keys = [test_keypair(1)];
        let mut node = node(1, &genesis(&keys));
        node.initialize();

        node.set_time(Duration::from_millis(500));
        let actions = node.handle(Event::BroadcastTimer);
        assert!(broadcasts(&actions).is_empty());

        node.set_time(Duration::from_millis(2000));
        let actions = node.handle(Event::BroadcastTimer);
        assert_eq!(broadcasts(&actions).len(), 1);
        assert_eq!(node.stats().rebroadcasts, 1);
    }

    #[test]
    fn test_two_nodes_reach_consensus() {
        let keys = [test_keypair(1), test_keypair(2)];
        let genesis = genesis(&keys);
        let mut nodes = [node(1, &genesis), node(2, &genesis)];
        for n in nodes.iter_mut() {
            n.initialize();
        }
        let mut inbox: Vec<Vec<BeliefGossip>> = vec![vec![], vec![]];
        for (i, actions) in [submit(&mut nodes[0], &keys[0], 100), submit(&mut nodes[1], &keys[1], 100)]
            .into_iter()
            .enumerate()
        {
            inbox[1 - i].extend(broadcasts(&actions));
        }

        // Deliver everything every 100ms, firing broadcast timers in between.
        for step in 2..40u64 {
            let now = Duration::from_millis(step * 100);
            let mut outbox: Vec<Vec<BeliefGossip>> = vec![vec![], vec![]];
            for (i, node) in nodes.iter_mut().enumerate() {
                node.set_time(now);
                let mut actions = node.handle(Event::BeliefsReceived {
                    beliefs: std::mem::take(&mut inbox[i]),
                });
                actions.extend(node.handle(Event::BroadcastTimer));
                outbox[1 - i].extend(broadcasts(&actions));
            }
            inbox = outbox;
        }

        for node in &nodes {
            assert!(!node.is_halted());
            assert_eq!(node.peer().state_position(), 2);
            assert_eq!(node.peer().consensus_state().transactions_applied, 2);
        }
        assert_eq!(
            nodes[0].peer().consensus_state(),
            nodes[1].peer().consensus_state()
        );
    }

    #[test]
    fn test_foreign_network_beliefs_are_dropped() {
        let keys = [test_keypair(1), test_keypair(2)];
        let mut node = node(1, &genesis(&keys));
        let other = Belief::create_single_order(&keys[1]);
        let gossip = BeliefGossip::new(Hash::from_bytes(b"elsewhere"), keys[1].public_key(), other);

        let actions = node.handle(Event::BeliefsReceived {
            beliefs: vec![gossip],
        });
        assert!(actions.is_empty());
        assert_eq!(node.stats().foreign_beliefs, 1);
        assert_eq!(node.stats().merges, 0);
    }

    #[test]
    fn test_block_without_stake_is_rejected() {
        let keys = [test_keypair(1), test_keypair(2)];
        let genesis = genesis(&keys);
        let mut observer = node(3, &genesis);
        let actions = submit(&mut observer, &test_keypair(3), 100);
        assert!(actions.is_empty());
        assert_eq!(observer.stats().rejected_blocks, 1);
        assert_eq!(observer.peer().peer_order().map(|o| o.len()), Some(0));
    }

    #[test]
    #[traced_test]
    fn test_fork_without_recovery_halts_node() {
        let keypair = test_keypair(1);
        let genesis = genesis(std::slice::from_ref(&keypair));
        let blocks: Vec<_> = (1..=3)
            .map(|ts| Signed::sign(&keypair, Block::new(ts, vec![])))
            .collect();
        let applied = Peer::create(keypair.clone(), genesis, PeerConfig::default())
            .update_belief(Belief::from_signed_orders([Signed::sign(
                &keypair,
                test_order(&blocks, 3, 3, 3),
            )]))
            .update_state(&TestLedger)
            .unwrap();

        // Own order rewritten to a different history behind the node's back.
        let forked = applied.update_belief(Belief::from_signed_orders([Signed::sign(
            &keypair,
            test_order(&[Signed::sign(&keypair, Block::new(9, vec![]))], 1, 1, 9),
        )]));
        let mut node = NodeStateMachine::new(1, forked, Arc::new(TestLedger), NodeConfig::default());
        node.set_time(Duration::from_millis(20));

        let network_id = node.network_id();
        let peer_two = test_keypair(2);
        let actions = node.handle(Event::BeliefsReceived {
            beliefs: vec![BeliefGossip::new(
                network_id,
                peer_two.public_key(),
                Belief::create_single_order(&peer_two),
            )],
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StopConsensus { .. })));
        assert!(node.is_halted());
        assert!(logs_contain("Stopping consensus"));

        assert!(node.handle(Event::BroadcastTimer).is_empty());
    }
}
