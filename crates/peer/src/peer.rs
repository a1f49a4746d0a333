//! Peer state and transitions.

use crate::{PeerConfig, PeerError};
use cpos_belief::{Belief, BeliefMergeContext};
use cpos_engine::{
    prevalidate_blocks, BlockExecutor, BlockResult, LedgerState, TransactionResult,
    ValidationSummary,
};
use cpos_types::{encoding::hash_value, Block, Hash, KeyPair, Order, PeerKey, Signed, SignedBlock, Timestamp};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A peer's complete local view.
///
/// `Peer` is an immutable value: every transition returns a new peer and
/// leaves `self` untouched, so callers may keep earlier snapshots. The
/// owner serializes transitions.
///
/// # State
///
/// - `belief`: latest merged belief, own order included
/// - `consensus_order`: the order whose blocks `[0, state_position)` have
///   been applied to `state`
/// - `block_results`: results for positions `[history_position, state_position)`
///
/// `state` is always the result of applying
/// `consensus_order.blocks()[..state_position]` to `genesis_state`.
#[derive(Clone)]
pub struct Peer<S: LedgerState> {
    pub(crate) keypair: Arc<KeyPair>,
    pub(crate) key: PeerKey,
    pub(crate) config: PeerConfig,
    pub(crate) belief: Belief,
    pub(crate) timestamp: Timestamp,
    pub(crate) consensus_order: Order,
    pub(crate) state_position: usize,
    pub(crate) state: S,
    pub(crate) genesis_state: S,
    pub(crate) history_position: usize,
    pub(crate) block_results: Vec<Arc<BlockResult<S>>>,
}

impl<S: LedgerState> Peer<S> {
    /// Fresh peer at genesis with an empty own order.
    pub fn create(keypair: KeyPair, genesis: S, config: PeerConfig) -> Self {
        let belief = Belief::create_single_order(&keypair);
        let key = keypair.public_key();
        Peer {
            keypair: Arc::new(keypair),
            key,
            config,
            belief,
            timestamp: genesis.timestamp(),
            consensus_order: Order::create(),
            state_position: 0,
            state: genesis.clone(),
            genesis_state: genesis,
            history_position: 0,
            block_results: Vec::new(),
        }
    }

    /// Fresh peer that immediately merges a belief obtained from the
    /// network and catches up with its consensus.
    pub fn join<E>(
        keypair: KeyPair,
        genesis: S,
        config: PeerConfig,
        executor: &E,
        remote: Belief,
        now: Timestamp,
    ) -> Result<Self, PeerError>
    where
        E: BlockExecutor<State = S>,
    {
        Self::create(keypair, genesis, config)
            .update_timestamp(now)
            .merge_beliefs(executor, &[Some(remote)])?
            .update_state(executor)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub fn peer_key(&self) -> PeerKey {
        self.key
    }

    pub fn keypair(&self) -> &Arc<KeyPair> {
        &self.keypair
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn belief(&self) -> &Belief {
        &self.belief
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Latest order held for `peer`.
    pub fn get_order(&self, peer: &PeerKey) -> Option<&Order> {
        self.belief.order(peer)
    }

    /// This peer's own current order.
    pub fn peer_order(&self) -> Option<&Order> {
        self.belief.order(&self.key)
    }

    /// Order whose prefix has been applied to state.
    pub fn consensus_order(&self) -> &Order {
        &self.consensus_order
    }

    /// Consensus point of the own order.
    pub fn finality_point(&self) -> usize {
        self.peer_order().map_or(0, Order::consensus_point)
    }

    pub fn state_position(&self) -> usize {
        self.state_position
    }

    pub fn history_position(&self) -> usize {
        self.history_position
    }

    /// Ledger state after all applied blocks.
    pub fn consensus_state(&self) -> &S {
        &self.state
    }

    pub fn genesis_state(&self) -> &S {
        &self.genesis_state
    }

    /// Identity of the network: the hash of the genesis state.
    pub fn network_id(&self) -> Hash {
        hash_value(&self.genesis_state)
    }

    /// Whether this peer may propose blocks.
    ///
    /// A lone peer always may. Otherwise its stake in the current state must
    /// reach `min_stake`.
    pub fn is_ready_to_publish<E>(&self, executor: &E, min_stake: u64) -> bool
    where
        E: BlockExecutor<State = S>,
    {
        let stakes = executor.compute_stakes(&self.state);
        if stakes.len() <= 1 {
            return true;
        }
        stakes.stake(&self.key) >= min_stake.max(1)
    }

    /// Result of applying block `position`, if still retained.
    pub fn block_result(&self, position: usize) -> Option<&BlockResult<S>> {
        let index = position.checked_sub(self.history_position)?;
        self.block_results.get(index).map(Arc::as_ref)
    }

    pub fn transaction_result(&self, position: usize, tx: usize) -> Option<&TransactionResult> {
        self.block_result(position)?.transaction(tx)
    }

    /// Ledger state after the first `position` blocks.
    ///
    /// Position 0 is always available. Other positions are available while
    /// the result that produced them is retained.
    pub fn historical_state(&self, position: usize) -> Option<&S> {
        if position == 0 {
            return Some(&self.genesis_state);
        }
        if position > self.state_position {
            return None;
        }
        self.block_result(position - 1).map(|r| &r.state)
    }

    pub fn retained_results(&self) -> usize {
        self.block_results.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════

    /// Move the logical clock forward. Earlier times are ignored.
    pub fn update_timestamp(&self, timestamp: Timestamp) -> Self {
        if timestamp <= self.timestamp {
            return self.clone();
        }
        Peer {
            timestamp,
            ..self.clone()
        }
    }

    /// Replace the belief. Applied state is untouched until `update_state`.
    pub fn update_belief(&self, belief: Belief) -> Self {
        Peer {
            belief,
            ..self.clone()
        }
    }

    /// Merge received beliefs using stakes from the current consensus state.
    #[instrument(skip_all, fields(peer = %self.key, incoming = beliefs.len()))]
    pub fn merge_beliefs<E>(&self, executor: &E, beliefs: &[Option<Belief>]) -> Result<Self, PeerError>
    where
        E: BlockExecutor<State = S>,
    {
        let stakes = executor.compute_stakes(&self.state);
        let ctx = BeliefMergeContext::new(
            Arc::clone(&self.keypair),
            self.timestamp,
            Arc::new(stakes),
            self.config.merge,
        );
        let merged = self.belief.merge(&ctx, beliefs)?;

        let old_finality = self.finality_point();
        let new_finality = merged.order(&self.key).map_or(0, Order::consensus_point);
        if new_finality < old_finality {
            warn!(
                old = old_finality,
                new = new_finality,
                "Finality point receded"
            );
        }
        Ok(self.update_belief(merged))
    }

    /// Sign `block` and append it to the own order.
    pub fn propose_block(&self, block: Block) -> Self {
        let timestamp = self.timestamp.max(block.timestamp);
        let signed: SignedBlock = Signed::sign(&self.keypair, block);
        debug!(block = %signed.hash(), timestamp, "Proposing block");
        Peer {
            belief: self.belief.propose_block(&self.keypair, signed, timestamp),
            timestamp,
            ..self.clone()
        }
    }

    /// Apply newly agreed blocks to state.
    ///
    /// Detects forks against the previously applied order. With fork
    /// recovery enabled the state is rolled back to the last common
    /// checkpoint first; otherwise a fork is fatal.
    #[instrument(skip_all, fields(peer = %self.key, position = self.state_position))]
    pub fn update_state<E>(&self, executor: &E) -> Result<Self, PeerError>
    where
        E: BlockExecutor<State = S>,
    {
        let order = self
            .peer_order()
            .cloned()
            .ok_or(PeerError::MissingOwnOrder { peer: self.key })?;

        let common = order.common_prefix_length(&self.consensus_order);
        let mut next = if common < self.state_position {
            self.roll_back(common)?
        } else {
            self.clone()
        };

        let target = order.consensus_point();
        if target > next.state_position {
            let pending = &order.blocks()[next.state_position..target];
            if self.config.parallel_verification {
                // Blocks are applied on this thread, inside the update span.
                let mut summary = ValidationSummary::default();
                rayon::in_place_scope(|scope| {
                    scope.spawn(|_| summary = prevalidate_blocks(pending));
                    next.apply_blocks(executor, pending);
                });
                if !summary.all_valid() {
                    debug!(
                        invalid_blocks = summary.invalid_blocks,
                        invalid_transactions = summary.invalid_transactions,
                        "Agreed blocks contain bad signatures"
                    );
                }
            } else {
                next.apply_blocks(executor, pending);
            }
            info!(
                from = self.state_position,
                to = next.state_position,
                "Advanced consensus state"
            );
        }

        next.consensus_order = order;
        Ok(next)
    }

    fn roll_back(&self, common: usize) -> Result<Self, PeerError> {
        if !self.config.fork_recovery {
            return Err(PeerError::ForkDetected {
                common,
                applied: self.state_position,
            });
        }
        let state = self
            .historical_state(common)
            .cloned()
            .ok_or(PeerError::CheckpointUnavailable {
                position: common,
                history_position: self.history_position,
            })?;

        warn!(
            applied = self.state_position,
            common,
            "Fork detected, rolling back applied state"
        );
        let mut next = self.clone();
        if common < self.history_position {
            // Only reachable for genesis, which is always kept.
            next.block_results.clear();
            next.history_position = 0;
        } else {
            next.block_results.truncate(common - self.history_position);
        }
        next.state = state;
        next.state_position = common;
        Ok(next)
    }

    fn apply_blocks<E>(&mut self, executor: &E, blocks: &[SignedBlock])
    where
        E: BlockExecutor<State = S>,
    {
        for block in blocks {
            let result = executor.apply_block(&self.state, block);
            if result.state == self.state {
                debug!(
                    position = self.state_position,
                    block = %block.hash(),
                    "Block left state unchanged"
                );
            }
            self.state = result.state.clone();
            self.block_results.push(Arc::new(result));
            self.state_position += 1;
        }
    }

    /// Drop block results whose state is older than `before`.
    ///
    /// The newest result is always kept so the current position stays
    /// answerable, and genesis is never dropped.
    pub fn prune_history(&self, before: Timestamp) -> Self {
        let prunable = self
            .block_results
            .iter()
            .take_while(|r| r.state.timestamp() < before)
            .count()
            .min(self.block_results.len().saturating_sub(1));
        if prunable == 0 {
            return self.clone();
        }

        debug!(pruned = prunable, "Pruned block history");
        let mut next = self.clone();
        next.block_results.drain(..prunable);
        next.history_position += prunable;
        next
    }
}

impl<S: LedgerState> fmt::Debug for Peer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("key", &self.key)
            .field("timestamp", &self.timestamp)
            .field("state_position", &self.state_position)
            .field("history_position", &self.history_position)
            .field("finality_point", &self.finality_point())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpos_engine::test_utils::{TestLedger, TestOp, TestState};
    use cpos_types::test_utils::{test_keypair, test_order, test_transaction};
    use tracing_test::traced_test;

    fn single_peer() -> Peer<TestState> {
        let keypair = test_keypair(1);
        let genesis = TestState::genesis([(keypair.public_key(), 100)]);
        Peer::create(keypair, genesis, PeerConfig::default())
    }

    #[test]
    fn test_create_starts_at_genesis() {
        let peer = single_peer();
        assert_eq!(peer.state_position(), 0);
        assert_eq!(peer.consensus_state(), peer.genesis_state());
        assert!(peer.is_ready_to_publish(&TestLedger, 1_000));
        assert_eq!(peer.finality_point(), 0);
        assert_eq!(peer.historical_state(0), Some(peer.genesis_state()));
    }

    #[test]
    fn test_sole_staker_reaches_consensus_alone() {
        let peer = single_peer().update_timestamp(5);
        let tx = test_transaction(&peer.keypair, 1, &TestOp::Noop.to_payload());
        let peer = peer.propose_block(Block::new(5, vec![tx]));

        // Three merges: propose, then confirm proposal, then confirm consensus.
        let mut peer = peer;
        for ts in [10, 20, 30] {
            peer = peer
                .update_timestamp(ts)
                .merge_beliefs(&TestLedger, &[])
                .unwrap()
                .update_state(&TestLedger)
                .unwrap();
        }

        assert_eq!(peer.finality_point(), 1);
        assert_eq!(peer.state_position(), 1);
        assert_eq!(peer.consensus_state().transactions_applied, 1);
        assert!(peer.transaction_result(0, 0).unwrap().is_success());
        assert_eq!(peer.historical_state(1), Some(peer.consensus_state()));
    }

    #[test]
    fn test_ready_to_publish_requires_stake() {
        let keypair = test_keypair(1);
        let other = test_keypair(2);
        let genesis = TestState::genesis([(keypair.public_key(), 50), (other.public_key(), 10)]);
        let peer = Peer::create(keypair, genesis.clone(), PeerConfig::default());
        assert!(peer.is_ready_to_publish(&TestLedger, 20));
        let poor = Peer::create(other, genesis, PeerConfig::default());
        assert!(!poor.is_ready_to_publish(&TestLedger, 20));
        assert!(poor.is_ready_to_publish(&TestLedger, 10));

        let observer = Peer::create(test_keypair(3), peer.genesis_state().clone(), PeerConfig::default());
        assert!(!observer.is_ready_to_publish(&TestLedger, 0));
    }

    #[test]
    fn test_propose_block_bumps_timestamp() {
        let peer = single_peer().update_timestamp(10);
        let proposed = peer.propose_block(Block::new(25, vec![]));
        assert_eq!(proposed.timestamp(), 25);
        assert_eq!(proposed.peer_order().unwrap().len(), 1);
        assert_eq!(proposed.state_position(), 0);

        let earlier = peer.propose_block(Block::new(3, vec![]));
        assert_eq!(earlier.timestamp(), 10);
    }

    #[test]
    fn test_update_timestamp_never_goes_back() {
        let peer = single_peer().update_timestamp(50);
        assert_eq!(peer.update_timestamp(40).timestamp(), 50);
    }

    #[test]
    fn test_fork_without_recovery_is_fatal() {
        let keypair = test_keypair(1);
        let genesis = TestState::genesis([(keypair.public_key(), 100)]);
        let peer = Peer::create(keypair.clone(), genesis, PeerConfig::default());

        let blocks: Vec<_> = (1..=3)
            .map(|ts| Signed::sign(&keypair, Block::new(ts, vec![])))
            .collect();
        let applied = peer
            .update_belief(Belief::from_signed_orders([Signed::sign(
                &keypair,
                test_order(&blocks, 3, 3, 3),
            )]))
            .update_state(&TestLedger)
            .unwrap();
        assert_eq!(applied.state_position(), 3);

        let other = Signed::sign(&keypair, Block::new(9, vec![]));
        let forked = applied.update_belief(Belief::from_signed_orders([Signed::sign(
            &keypair,
            test_order(&[blocks[0].clone(), other], 2, 2, 9),
        )]));
        let err = forked.update_state(&TestLedger).unwrap_err();
        assert!(matches!(
            err,
            PeerError::ForkDetected {
                common: 1,
                applied: 3
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_prune_keeps_newest_result() {
        let keypair = test_keypair(1);
        let genesis = TestState::genesis([(keypair.public_key(), 100)]);
        let blocks: Vec<_> = (1..=4)
            .map(|ts| Signed::sign(&keypair, Block::new(ts * 10, vec![])))
            .collect();
        let peer = Peer::create(keypair.clone(), genesis, PeerConfig::default())
            .update_belief(Belief::from_signed_orders([Signed::sign(
                &keypair,
                test_order(&blocks, 4, 4, 40),
            )]))
            .update_state(&TestLedger)
            .unwrap();

        let pruned = peer.prune_history(25);
        assert_eq!(pruned.history_position(), 2);
        assert_eq!(pruned.retained_results(), 2);
        assert!(pruned.block_result(1).is_none());
        assert!(pruned.block_result(2).is_some());
        assert!(pruned.historical_state(2).is_none());
        assert_eq!(pruned.historical_state(3), peer.historical_state(3));
        assert_eq!(pruned.historical_state(0), Some(peer.genesis_state()));

        let all = peer.prune_history(u64::MAX);
        assert_eq!(all.retained_results(), 1);
        assert_eq!(all.history_position(), 3);
        assert_eq!(all.historical_state(4), Some(peer.consensus_state()));
    }

    #[test]
    #[traced_test]
    fn test_unchanged_state_is_logged_not_fatal() {
        let keypair = test_keypair(1);
        let mallory = test_keypair(2);
        let genesis = TestState::genesis([(keypair.public_key(), 100)]);
        let bad = Signed::from_parts(
            Block::new(1, vec![]),
            keypair.public_key(),
            *Signed::sign(&mallory, Block::new(1, vec![])).signature(),
        );
        let peer = Peer::create(keypair.clone(), genesis, PeerConfig::default())
            .update_belief(Belief::from_signed_orders([Signed::sign(
                &keypair,
                test_order(&[bad], 1, 1, 1),
            )]))
            .update_state(&TestLedger)
            .unwrap();

        assert_eq!(peer.state_position(), 1);
        assert_eq!(peer.consensus_state(), peer.genesis_state());
        assert!(logs_contain("Block left state unchanged"));
    }

    #[test]
    #[traced_test]
    fn test_blocks_applied_within_update_span() {
        let keypair = test_keypair(1);
        let genesis = TestState::genesis([(keypair.public_key(), 100)]);
        let config = PeerConfig {
            parallel_verification: true,
            ..PeerConfig::default()
        };
        let forged = Signed::from_parts(
            Block::new(1, vec![]),
            keypair.public_key(),
            *Signed::sign(&test_keypair(2), Block::new(1, vec![])).signature(),
        );
        let peer = Peer::create(keypair.clone(), genesis, config)
            .update_belief(Belief::from_signed_orders([Signed::sign(
                &keypair,
                test_order(&[forged], 1, 1, 1),
            )]))
            .update_state(&TestLedger)
            .unwrap();

        assert_eq!(peer.state_position(), 1);
        assert!(logs_contain("update_state{"));
        assert!(logs_contain("Block left state unchanged"));
        assert!(logs_contain("Agreed blocks contain bad signatures"));
    }
}
