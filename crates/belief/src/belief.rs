//! Beliefs and the belief merge.

use crate::vote::{self, VotingSet, WinningOrder};
use crate::{BeliefMergeContext, MergeError};
use cpos_types::{
    common_prefix_length, exceeds_threshold, KeyPair, Order, PeerKey, Signed, SignedBlock, SignedOrder, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument, trace, warn};

/// A peer's aggregated view: the latest signed order heard from each peer,
/// its own included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Belief {
    orders: BTreeMap<PeerKey, SignedOrder>,
    timestamp: Timestamp,
}

impl Belief {
    /// Empty belief with no orders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Belief holding only an empty order signed by `keypair`.
    pub fn create_single_order(keypair: &KeyPair) -> Self {
        let signed = Signed::sign(keypair, Order::create());
        Self::from_signed_orders([signed])
    }

    /// Belief from signed orders, each keyed by its signer. The timestamp is
    /// the latest order timestamp.
    pub fn from_signed_orders(orders: impl IntoIterator<Item = SignedOrder>) -> Self {
        let orders: BTreeMap<PeerKey, SignedOrder> =
            orders.into_iter().map(|o| (o.signer(), o)).collect();
        let timestamp = orders
            .values()
            .map(|o| o.value().timestamp())
            .max()
            .unwrap_or(0);
        Belief { orders, timestamp }
    }

    pub fn with_orders(&self, orders: BTreeMap<PeerKey, SignedOrder>) -> Self {
        Belief {
            orders,
            timestamp: self.timestamp,
        }
    }

    pub fn with_timestamp(&self, timestamp: Timestamp) -> Self {
        Belief {
            orders: self.orders.clone(),
            timestamp,
        }
    }

    pub fn orders(&self) -> &BTreeMap<PeerKey, SignedOrder> {
        &self.orders
    }

    pub fn order(&self, peer: &PeerKey) -> Option<&Order> {
        self.orders.get(peer).map(|o| o.value())
    }

    pub fn signed_order(&self, peer: &PeerKey) -> Option<&SignedOrder> {
        self.orders.get(peer)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Append a locally signed block to the order of `keypair`'s peer.
    ///
    /// The order is re-signed at `timestamp`. Nothing is agreed by this; the
    /// block spreads through the next merges.
    pub fn propose_block(
        &self,
        keypair: &KeyPair,
        block: SignedBlock,
        timestamp: Timestamp,
    ) -> Belief {
        let peer = keypair.public_key();
        let current = self.order(&peer).cloned().unwrap_or_default();
        let order = current.append(block).with_timestamp(timestamp);

        let mut orders = self.orders.clone();
        orders.insert(peer, Signed::sign(keypair, order));
        Belief {
            orders,
            timestamp: self.timestamp.max(timestamp),
        }
    }

    /// Merge incoming beliefs into this one.
    ///
    /// `None` entries are skipped. The result does not depend on the order of
    /// `incoming` as long as each peer signs at most one order per timestamp.
    /// Rejected orders (future timestamps, bad signatures) are dropped
    /// silently; only a broken local belief or an algorithm defect errors.
    #[instrument(skip_all, fields(peer = %ctx.peer_key(), ts = ctx.timestamp(), incoming = incoming.len()))]
    pub fn merge(
        &self,
        ctx: &BeliefMergeContext,
        incoming: &[Option<Belief>],
    ) -> Result<Belief, MergeError> {
        let accumulated = self.accumulate_orders(ctx, incoming.iter().flatten());
        let result = self.vote(ctx, accumulated)?;

        let timestamp = ctx.timestamp().max(self.timestamp);
        if result == self.orders && timestamp == self.timestamp {
            return Ok(self.clone());
        }
        Ok(Belief {
            orders: result,
            timestamp,
        })
    }

    /// Take in the orders of `other` without voting. The timestamp is kept.
    pub fn merge_orders(&self, ctx: &BeliefMergeContext, other: &Belief) -> Belief {
        self.with_orders(self.accumulate_orders(ctx, std::iter::once(other)))
    }

    fn accumulate_orders<'a>(
        &self,
        ctx: &BeliefMergeContext,
        beliefs: impl Iterator<Item = &'a Belief>,
    ) -> BTreeMap<PeerKey, SignedOrder> {
        let mut result = self.orders.clone();
        for belief in beliefs {
            accumulate_into(ctx, &mut result, belief);
        }
        result
    }

    fn vote(
        &self,
        ctx: &BeliefMergeContext,
        accumulated: BTreeMap<PeerKey, SignedOrder>,
    ) -> Result<BTreeMap<PeerKey, SignedOrder>, MergeError> {
        let me = ctx.peer_key();
        let my_order = self
            .order(&me)
            .cloned()
            .ok_or(MergeError::MissingOwnOrder { peer: me })?;

        let stakes = ctx.stakes();
        let contradicting = accumulated
            .iter()
            .filter(|(_, signed)| {
                my_order.common_prefix_length(signed.value()) < my_order.consensus_point()
            })
            .map(|(peer, _)| stakes.stake(peer))
            .fold(0u64, u64::saturating_add);
        if exceeds_threshold(contradicting, stakes.total(), ctx.config().proposal_threshold) {
            warn!(
                contradicting,
                total = stakes.total(),
                consensus_point = my_order.consensus_point(),
                "Confirmed history contradicted by a stake majority"
            );
        }

        let mut filtered: BTreeMap<PeerKey, SignedOrder> = accumulated
            .into_iter()
            .filter(|(_, signed)| my_order.is_consistent(signed.value()))
            .collect();

        let consensus = {
            let voters = VotingSet::prepare(&filtered, stakes);
            let winning_blocks = match vote::compute_winning_order(&voters, &my_order) {
                WinningOrder::Winner(blocks) => blocks,
                WinningOrder::NoWinner => {
                    debug!("No staked order to vote on, keeping own order");
                    return Ok(filtered);
                }
            };

            // Candidates always match our confirmed history, so the winner
            // keeps our consensus point. Work proposed past the fork point
            // is no longer proposed.
            let matched = common_prefix_length(my_order.blocks(), &winning_blocks);
            let proposal_point = my_order
                .proposal_point()
                .min(matched)
                .max(my_order.consensus_point());
            let winning = Order::from_parts(
                winning_blocks,
                proposal_point,
                my_order.consensus_point(),
                my_order.timestamp(),
            )?;

            let config = ctx.config();
            let proposed = vote::update_proposal(
                &winning,
                &voters,
                stakes.total(),
                config.proposal_threshold,
            )?;
            vote::update_consensus(&proposed, &voters, stakes.total(), config.consensus_threshold)?
        };

        if !consensus.consensus_equals(&my_order) {
            let matched = consensus.common_prefix_length(&my_order);
            let held_long_enough = ctx.timestamp()
                > my_order
                    .timestamp()
                    .saturating_add(ctx.config().keep_proposal_millis());
            if matched >= my_order.proposal_point() || held_long_enough {
                debug!(
                    len = consensus.len(),
                    proposal_point = consensus.proposal_point(),
                    consensus_point = consensus.consensus_point(),
                    "Adopting new order"
                );
                let timestamp = ctx.timestamp().max(my_order.timestamp());
                let signed = ctx.sign(consensus.with_timestamp(timestamp));
                filtered.insert(me, signed);
            } else {
                trace!(matched, "Holding current proposal");
            }
        }
        Ok(filtered)
    }
}

/// Fold the orders of `belief` into `result`, keeping the most
/// authoritative order per peer.
fn accumulate_into(
    ctx: &BeliefMergeContext,
    result: &mut BTreeMap<PeerKey, SignedOrder>,
    belief: &Belief,
) {
    for (peer, candidate) in &belief.orders {
        let order = candidate.value();
        if order.timestamp() > ctx.timestamp() {
            trace!(peer = %peer, ts = order.timestamp(), "Ignoring order from the future");
            continue;
        }
        if let Some(held) = result.get(peer) {
            if held == candidate || !compare_orders(held.value(), order) {
                continue;
            }
        }
        if candidate.signer() != *peer || !candidate.verify() {
            debug!(peer = %peer, "Dropping order with invalid signature");
            continue;
        }
        result.insert(*peer, candidate.clone());
    }
}

/// Whether `candidate` should replace `held` for the same peer.
///
/// A newer timestamp always wins and an older one never does. At equal
/// timestamps the candidate must have a greater consensus point, else a
/// greater proposal point, else more blocks.
pub fn compare_orders(held: &Order, candidate: &Order) -> bool {
    use std::cmp::Ordering;
    match held.timestamp().cmp(&candidate.timestamp()) {
        Ordering::Greater => false,
        Ordering::Less => true,
        Ordering::Equal => {
            candidate.consensus_point() > held.consensus_point()
                || candidate.proposal_point() > held.proposal_point()
                || candidate.len() > held.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MergeConfig;
    use cpos_types::test_utils::{test_block, test_keypair, test_order};
    use cpos_types::StakeTable;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn context(keypair: &KeyPair, timestamp: Timestamp, stakes: &[(&KeyPair, u64)]) -> BeliefMergeContext {
        let table: StakeTable = stakes.iter().map(|(k, s)| (k.public_key(), *s)).collect();
        BeliefMergeContext::new(
            Arc::new(keypair.clone()),
            timestamp,
            Arc::new(table),
            MergeConfig::default(),
        )
    }

    #[test]
    fn test_compare_orders_prefers_higher_consensus_at_equal_timestamp() {
        let kp = test_keypair(1);
        let blocks: Vec<_> = (0..6).map(|i| test_block(&kp, i)).collect();
        let a = test_order(&blocks, 5, 5, 10);
        let b = test_order(&blocks, 6, 6, 10);
        let b_same_pp = test_order(&blocks, 6, 6, 10);
        assert!(compare_orders(&a, &b));
        assert!(!compare_orders(&b, &b_same_pp));
    }

    #[test]
    fn test_compare_orders_timestamp_dominates() {
        let kp = test_keypair(1);
        let blocks: Vec<_> = (0..3).map(|i| test_block(&kp, i)).collect();
        let old_advanced = test_order(&blocks, 3, 3, 5);
        let new_empty = test_order(&[], 0, 0, 6);
        assert!(compare_orders(&old_advanced, &new_empty));
        assert!(!compare_orders(&new_empty, &old_advanced));
    }

    #[test]
    fn test_compare_orders_falls_back_to_length() {
        let kp = test_keypair(1);
        let blocks: Vec<_> = (0..3).map(|i| test_block(&kp, i)).collect();
        let short = test_order(&blocks[..2], 1, 0, 4);
        let long = test_order(&blocks, 1, 0, 4);
        assert!(compare_orders(&short, &long));
        assert!(!compare_orders(&long, &short));
    }

    #[test]
    fn test_merge_with_nothing_new_is_identity() {
        let kp = test_keypair(1);
        let belief = Belief::create_single_order(&kp);
        let ctx = context(&kp, belief.timestamp(), &[(&kp, 100)]);
        let merged = belief.merge(&ctx, &[]).unwrap();
        assert_eq!(merged, belief);

        let merged = belief.merge(&ctx, &[None, None]).unwrap();
        assert_eq!(merged, belief);
    }

    #[test]
    fn test_future_orders_are_ignored() {
        let (a, b) = (test_keypair(1), test_keypair(2));
        let own = Belief::create_single_order(&a);
        let future = Belief::from_signed_orders([Signed::sign(
            &b,
            test_order(&[test_block(&b, 1)], 0, 0, 500),
        )]);
        let ctx = context(&a, 100, &[(&a, 50), (&b, 50)]);
        let merged = own.merge(&ctx, &[Some(future)]).unwrap();
        assert!(merged.order(&b.public_key()).is_none());
    }

    #[test]
    fn test_orders_with_mismatched_signer_are_dropped() {
        let (a, b, mallory) = (test_keypair(1), test_keypair(2), test_keypair(3));
        let own = Belief::create_single_order(&a);
        let forged = Signed::sign(&mallory, test_order(&[test_block(&mallory, 1)], 0, 0, 5));
        let mut orders = BTreeMap::new();
        orders.insert(b.public_key(), forged);
        let incoming = Belief::new().with_orders(orders);

        let ctx = context(&a, 10, &[(&a, 50), (&b, 50)]);
        let merged = own.merge(&ctx, &[Some(incoming)]).unwrap();
        assert!(merged.order(&b.public_key()).is_none());
    }

    #[test]
    fn test_missing_own_order_is_fatal() {
        let (a, b) = (test_keypair(1), test_keypair(2));
        let belief = Belief::create_single_order(&b);
        let ctx = context(&a, 10, &[(&a, 50)]);
        assert_eq!(
            belief.merge(&ctx, &[]),
            Err(MergeError::MissingOwnOrder {
                peer: a.public_key()
            })
        );
    }

    #[test]
    fn test_propose_block_appends_and_bumps_timestamp() {
        let kp = test_keypair(1);
        let belief = Belief::create_single_order(&kp);
        let block = test_block(&kp, 42);
        let proposed = belief.propose_block(&kp, block.clone(), 42);

        let order = proposed.order(&kp.public_key()).unwrap();
        assert_eq!(order.len(), 1);
        assert_eq!(order.block(0).unwrap().hash(), block.hash());
        assert_eq!(order.timestamp(), 42);
        assert_eq!(proposed.timestamp(), 42);
        assert!(proposed.signed_order(&kp.public_key()).unwrap().verify());
    }

    #[test]
    fn test_merge_orders_accumulates_without_voting() {
        let (a, b) = (test_keypair(1), test_keypair(2));
        let own = Belief::create_single_order(&a);
        let other = Belief::create_single_order(&b).propose_block(&b, test_block(&b, 3), 3);
        let ctx = context(&a, 10, &[(&a, 50), (&b, 50)]);

        let merged = own.merge_orders(&ctx, &other);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.timestamp(), own.timestamp());
        assert_eq!(merged.order(&a.public_key()), own.order(&a.public_key()));
    }

    #[test]
    fn test_merge_never_moves_timestamp_backwards() {
        let (a, b) = (test_keypair(1), test_keypair(2));
        let own = Belief::create_single_order(&a).propose_block(&a, test_block(&a, 50), 50);
        let other = Belief::create_single_order(&b).propose_block(&b, test_block(&b, 10), 10);
        // b holds no stake, so only the accumulated orders change.
        let ctx = context(&a, 20, &[(&a, 100)]);

        let merged = own.merge(&ctx, &[Some(other)]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.timestamp(), 50);
        assert_eq!(merged.order(&a.public_key()).unwrap().timestamp(), 50);
    }

    #[test]
    #[traced_test]
    fn test_contradicted_confirmed_history_is_logged() {
        let (a, b, c) = (test_keypair(1), test_keypair(2), test_keypair(3));
        let (x, y) = (test_block(&a, 1), test_block(&b, 2));
        let confirmed = test_order(&[x.clone(), y.clone()], 2, 2, 5);
        let own = Belief::from_signed_orders([Signed::sign(&a, confirmed.clone())]);
        let swapped = test_order(&[y, x], 2, 0, 8);
        let others = Belief::from_signed_orders([
            Signed::sign(&b, swapped.clone()),
            Signed::sign(&c, swapped),
        ]);
        let ctx = context(&a, 10, &[(&a, 40), (&b, 30), (&c, 30)]);

        let merged = own.merge(&ctx, &[Some(others)]).unwrap();
        assert_eq!(merged.order(&a.public_key()), Some(&confirmed));
        assert!(logs_contain("Confirmed history contradicted by a stake majority"));
    }

    #[test]
    #[traced_test]
    fn test_adopting_winner_is_logged() {
        let (a, b) = (test_keypair(1), test_keypair(2));
        let own = Belief::create_single_order(&a);
        let other = Belief::create_single_order(&b).propose_block(&b, test_block(&b, 3), 3);
        let ctx = context(&a, 10, &[(&a, 40), (&b, 60)]);

        let merged = own.merge(&ctx, &[Some(other)]).unwrap();
        let order = merged.order(&a.public_key()).unwrap();
        assert_eq!(order.len(), 1);
        assert_eq!(order.timestamp(), 10);
        assert!(logs_contain("Adopting new order"));
    }
}
