//! Stake-weighted voting over consistent orders.
//!
//! # Algorithm
//!
//! 1. Orders from peers with stake are grouped by block sequence.
//! 2. Starting at the local consensus point, groups are bucketed by their
//!    next block. The heaviest bucket survives to the next position; equal
//!    buckets are decided by the lowest block hash. A single group holding
//!    a strict majority of the stake still in play wins outright. If some
//!    voter has confirmed further than we have, voting starts at its
//!    consensus point and only groups sharing its confirmed blocks compete.
//! 3. Blocks seen beyond the consensus point but missing from the winner are
//!    appended, stably sorted by block timestamp.
//! 4. The proposal point and then the consensus point advance to the
//!    longest prefix backed by more than their threshold of total stake.

use cpos_types::{
    common_prefix_length, compare_block_timestamps, exceeds_threshold, Hash, Order, OrderError,
    PeerKey, SignedBlock, SignedOrder, StakeTable,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// A voting peer's order and stake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StakedOrder<'a> {
    pub order: &'a Order,
    pub stake: u64,
}

/// Orders from peers with non-zero stake.
#[derive(Debug)]
pub(crate) struct VotingSet<'a> {
    orders: Vec<StakedOrder<'a>>,
    considered_stake: u64,
}

impl<'a> VotingSet<'a> {
    /// Pick out orders whose signer holds stake. Peers absent from the table
    /// or with zero stake are left out of the vote entirely.
    pub fn prepare(orders: &'a BTreeMap<PeerKey, SignedOrder>, stakes: &StakeTable) -> Self {
        let mut considered_stake = 0u64;
        let orders = orders
            .iter()
            .filter_map(|(peer, signed)| {
                let stake = stakes.stake(peer);
                if stake == 0 {
                    return None;
                }
                considered_stake = considered_stake.saturating_add(stake);
                Some(StakedOrder {
                    order: signed.value(),
                    stake,
                })
            })
            .collect();
        Self {
            orders,
            considered_stake,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn considered_stake(&self) -> u64 {
        self.considered_stake
    }

    pub fn orders(&self) -> &[StakedOrder<'a>] {
        &self.orders
    }
}

/// Outcome of the multi-round vote.
#[derive(Debug, Clone)]
pub(crate) enum WinningOrder {
    /// Winning block sequence, new blocks already appended.
    Winner(Arc<[SignedBlock]>),
    /// No order carries any stake; keep the local order.
    NoWinner,
}

#[derive(Debug)]
struct VotingGroup {
    blocks: Arc<[SignedBlock]>,
    stake: u64,
}

/// Run the multi-round vote from the local consensus point.
pub(crate) fn compute_winning_order(voters: &VotingSet<'_>, local: &Order) -> WinningOrder {
    let mut groups: BTreeMap<Hash, VotingGroup> = BTreeMap::new();
    for voter in voters.orders() {
        let group = groups
            .entry(voter.order.blocks_digest())
            .or_insert_with(|| VotingGroup {
                blocks: voter.order.shared_blocks(),
                stake: 0,
            });
        group.stake = group.stake.saturating_add(voter.stake);
    }

    let consensus_point = local.consensus_point();
    let new_blocks = collect_new_blocks(groups.values(), consensus_point);

    // Only groups agreeing with the confirmed history can win. A voter that
    // is already confirmed past our consensus point fixes that history up to
    // its own consensus point.
    let (history, confirmed) = match confirmed_ahead(voters, consensus_point) {
        Some(order) => {
            debug!(
                from = consensus_point,
                to = order.consensus_point(),
                "Catching up to confirmed history"
            );
            (order.blocks(), order.consensus_point())
        }
        None => (local.blocks(), consensus_point),
    };
    let mut candidates: Vec<&VotingGroup> = groups
        .values()
        .filter(|g| common_prefix_length(&g.blocks, history) >= confirmed)
        .collect();
    if candidates.is_empty() {
        return WinningOrder::NoWinner;
    }

    let mut round_stake = voters.considered_stake();
    let mut position = confirmed;
    while candidates.len() > 1 {
        if let Some(majority) = candidates
            .iter()
            .copied()
            .find(|g| u128::from(g.stake) * 2 > u128::from(round_stake))
        {
            candidates = vec![majority];
            break;
        }

        let mut buckets: BTreeMap<Hash, (u64, Vec<&VotingGroup>)> = BTreeMap::new();
        for group in candidates.iter().copied() {
            let Some(block) = group.blocks.get(position) else {
                continue;
            };
            let bucket = buckets.entry(block.hash()).or_default();
            bucket.0 = bucket.0.saturating_add(group.stake);
            bucket.1.push(group);
        }

        // Ascending hash iteration with a strict comparison keeps the lowest
        // hash among equally staked buckets.
        let mut best: Option<(Hash, u64, Vec<&VotingGroup>)> = None;
        for (hash, (stake, members)) in buckets {
            if best.as_ref().map_or(true, |(_, s, _)| stake > *s) {
                best = Some((hash, stake, members));
            }
        }
        let Some((hash, stake, members)) = best else {
            break;
        };

        trace!(position, block = ?hash, stake, "Voting round decided");
        round_stake = stake;
        candidates = members;
        position += 1;
    }

    let winner = candidates[0];
    WinningOrder::Winner(append_new_blocks(&winner.blocks, new_blocks))
}

/// The voter confirmed furthest beyond `consensus_point`. Equal consensus
/// points go to the lowest block digest.
fn confirmed_ahead<'a>(voters: &VotingSet<'a>, consensus_point: usize) -> Option<&'a Order> {
    voters
        .orders()
        .iter()
        .map(|v| v.order)
        .filter(|order| order.consensus_point() > consensus_point)
        .min_by(|a, b| {
            b.consensus_point()
                .cmp(&a.consensus_point())
                .then_with(|| a.blocks_digest().cmp(&b.blocks_digest()))
        })
}

/// Blocks past the consensus point across all groups, deduplicated, in
/// first-observed order.
fn collect_new_blocks<'a>(
    groups: impl Iterator<Item = &'a VotingGroup>,
    consensus_point: usize,
) -> Vec<SignedBlock> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for group in groups {
        for block in group.blocks.iter().skip(consensus_point) {
            if seen.insert(block.hash()) {
                ordered.push(block.clone());
            }
        }
    }
    ordered
}

fn append_new_blocks(winner: &Arc<[SignedBlock]>, new_blocks: Vec<SignedBlock>) -> Arc<[SignedBlock]> {
    let present: HashSet<Hash> = winner.iter().map(|b| b.hash()).collect();
    let mut additions: Vec<SignedBlock> = new_blocks
        .into_iter()
        .filter(|b| !present.contains(&b.hash()))
        .collect();
    if additions.is_empty() {
        return Arc::clone(winner);
    }
    // Vec::sort_by is stable.
    additions.sort_by(compare_block_timestamps);

    let mut blocks = Vec::with_capacity(winner.len() + additions.len());
    blocks.extend_from_slice(winner);
    blocks.extend(additions);
    blocks.into()
}

/// Advance the proposal point of `winning`.
///
/// Voters are sorted by prefix agreement with the winning blocks, longest
/// first. Stake accumulates down that list; the voter whose stake crosses
/// the threshold sets the new proposal point.
pub(crate) fn update_proposal(
    winning: &Order,
    voters: &VotingSet<'_>,
    total_stake: u64,
    threshold: f64,
) -> Result<Order, OrderError> {
    let mut agreed: Vec<(usize, u64)> = voters
        .orders()
        .iter()
        .map(|v| (winning.common_prefix_length(v.order), v.stake))
        .collect();
    agreed.sort_by(|a, b| b.0.cmp(&a.0));

    let mut accumulated = 0u64;
    for (matched, stake) in agreed {
        accumulated = accumulated.saturating_add(stake);
        if exceeds_threshold(accumulated, total_stake, threshold) {
            let proposal_point = matched.max(winning.consensus_point());
            return winning.with_proposal_point(proposal_point);
        }
    }
    Ok(winning.clone())
}

/// Advance the consensus point of `proposed`.
///
/// Voters are scored by how far they agree with both the proposed blocks and
/// the lower of the two proposal points. Voters making no progress past the
/// current consensus point are discarded.
pub(crate) fn update_consensus(
    proposed: &Order,
    voters: &VotingSet<'_>,
    total_stake: u64,
    threshold: f64,
) -> Result<Order, OrderError> {
    let current = proposed.consensus_point();
    let mut agreed: Vec<(usize, u64)> = voters
        .orders()
        .iter()
        .filter_map(|v| {
            let prefix = proposed.common_prefix_length(v.order);
            let proposal = proposed.proposal_point().min(v.order.proposal_point());
            let matched = prefix.min(proposal);
            (matched > current).then_some((matched, v.stake))
        })
        .collect();
    agreed.sort_by(|a, b| b.0.cmp(&a.0));

    let mut accumulated = 0u64;
    for (matched, stake) in agreed {
        accumulated = accumulated.saturating_add(stake);
        if exceeds_threshold(accumulated, total_stake, threshold) {
            // with_consensus_point rejects any regression.
            return proposed.with_consensus_point(matched);
        }
    }
    Ok(proposed.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpos_types::test_utils::{test_block, test_keypair, test_order};
    use cpos_types::{KeyPair, Signed};

    fn signed_orders(entries: &[(&KeyPair, Order)]) -> BTreeMap<PeerKey, SignedOrder> {
        entries
            .iter()
            .map(|(kp, order)| (kp.public_key(), Signed::sign(kp, order.clone())))
            .collect()
    }

    fn stakes(entries: &[(&KeyPair, u64)]) -> StakeTable {
        entries.iter().map(|(kp, s)| (kp.public_key(), *s)).collect()
    }

    fn winner_blocks(outcome: WinningOrder) -> Arc<[SignedBlock]> {
        match outcome {
            WinningOrder::Winner(blocks) => blocks,
            WinningOrder::NoWinner => panic!("expected a winner"),
        }
    }

    #[test]
    fn test_equal_stake_tie_breaks_on_lowest_hash() {
        let (a, b, c) = (test_keypair(1), test_keypair(2), test_keypair(3));
        let block_a = test_block(&a, 10);
        let block_b = test_block(&b, 10);
        let orders = signed_orders(&[
            (&a, test_order(&[block_a.clone()], 0, 0, 1)),
            (&b, test_order(&[block_b.clone()], 0, 0, 1)),
            (&c, Order::create()),
        ]);
        let table = stakes(&[(&a, 40), (&b, 40)]);
        let voters = VotingSet::prepare(&orders, &table);

        let blocks = winner_blocks(compute_winning_order(&voters, &Order::create()));
        let lowest = if block_a.hash() < block_b.hash() { &block_a } else { &block_b };
        assert_eq!(blocks[0].hash(), lowest.hash());
        // The losing block is still carried as a new block.
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_heavier_bucket_beats_lower_hash() {
        let (a, b, c) = (test_keypair(1), test_keypair(2), test_keypair(3));
        let block_a = test_block(&a, 10);
        let block_b = test_block(&b, 11);
        let shared = test_order(&[block_a.clone()], 0, 0, 1);
        let orders = signed_orders(&[
            (&a, shared.clone()),
            (&b, test_order(&[block_b.clone()], 0, 0, 1)),
            (&c, shared.append(test_block(&c, 12))),
        ]);
        // a and c disagree after block_a but together outweigh b.
        let table = stakes(&[(&a, 30), (&b, 40), (&c, 30)]);
        let voters = VotingSet::prepare(&orders, &table);

        let blocks = winner_blocks(compute_winning_order(&voters, &Order::create()));
        assert_eq!(blocks[0].hash(), block_a.hash());
    }

    #[test]
    fn test_voter_confirmed_ahead_fixes_history() {
        let (a, b, c) = (test_keypair(1), test_keypair(2), test_keypair(3));
        let blocks = vec![test_block(&a, 1), test_block(&b, 2), test_block(&c, 3)];
        let reversed: Vec<_> = blocks.iter().rev().cloned().collect();
        let swapped = test_order(&reversed, 3, 0, 8);
        let orders = signed_orders(&[
            (&a, test_order(&blocks, 2, 2, 5)),
            (&b, swapped.clone()),
            (&c, swapped.clone()),
        ]);
        // b and c hold a majority, but a has already confirmed two blocks.
        let table = stakes(&[(&a, 40), (&b, 30), (&c, 30)]);
        let voters = VotingSet::prepare(&orders, &table);

        let winner = winner_blocks(compute_winning_order(&voters, &swapped));
        let hashes: Vec<Hash> = winner.iter().map(|b| b.hash()).collect();
        let expected: Vec<Hash> = blocks.iter().map(|b| b.hash()).collect();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn test_majority_wins_without_confirmed_voters() {
        let (a, b, c) = (test_keypair(1), test_keypair(2), test_keypair(3));
        let blocks = vec![test_block(&a, 1), test_block(&b, 2), test_block(&c, 3)];
        let reversed: Vec<_> = blocks.iter().rev().cloned().collect();
        let swapped = test_order(&reversed, 3, 0, 8);
        let orders = signed_orders(&[
            (&a, test_order(&blocks, 2, 0, 5)),
            (&b, swapped.clone()),
            (&c, swapped.clone()),
        ]);
        let table = stakes(&[(&a, 40), (&b, 30), (&c, 30)]);
        let voters = VotingSet::prepare(&orders, &table);

        let winner = winner_blocks(compute_winning_order(&voters, &swapped));
        assert_eq!(winner[0].hash(), reversed[0].hash());
    }

    #[test]
    fn test_no_stake_means_no_winner() {
        let a = test_keypair(1);
        let orders = signed_orders(&[(&a, test_order(&[test_block(&a, 1)], 0, 0, 1))]);
        let voters = VotingSet::prepare(&orders, &StakeTable::new());
        assert!(voters.is_empty());
        assert!(matches!(
            compute_winning_order(&voters, &Order::create()),
            WinningOrder::NoWinner
        ));
    }

    #[test]
    fn test_new_blocks_sorted_by_timestamp() {
        let (a, b) = (test_keypair(1), test_keypair(2));
        let base = test_block(&a, 1);
        let late = test_block(&a, 50);
        let early = test_block(&b, 20);
        let orders = signed_orders(&[
            (&a, test_order(&[base.clone(), late.clone()], 0, 0, 1)),
            (&b, test_order(&[early.clone()], 0, 0, 1)),
        ]);
        let table = stakes(&[(&a, 60), (&b, 40)]);
        let voters = VotingSet::prepare(&orders, &table);

        let blocks = winner_blocks(compute_winning_order(&voters, &Order::create()));
        let hashes: Vec<Hash> = blocks.iter().map(|b| b.hash()).collect();
        assert_eq!(hashes, vec![base.hash(), late.hash(), early.hash()]);
    }

    #[test]
    fn test_proposal_and_consensus_thresholds() {
        let (a, b, c) = (test_keypair(1), test_keypair(2), test_keypair(3));
        let blocks = vec![test_block(&a, 1), test_block(&a, 2)];
        let full = test_order(&blocks, 2, 0, 1);
        let orders = signed_orders(&[
            (&a, full.clone()),
            (&b, full.clone()),
            (&c, test_order(&blocks[..1], 1, 0, 1)),
        ]);
        let table = stakes(&[(&a, 40), (&b, 30), (&c, 30)]);
        let voters = VotingSet::prepare(&orders, &table);

        let winning = test_order(&blocks, 0, 0, 1);
        let proposed = update_proposal(&winning, &voters, table.total(), 0.5).unwrap();
        assert_eq!(proposed.proposal_point(), 2);

        // 70 agree on 2 blocks, which is above 0.67 of 100.
        let agreed = update_consensus(&proposed, &voters, table.total(), 0.67).unwrap();
        assert_eq!(agreed.consensus_point(), 2);

        // A stricter threshold needs c too, who only proposed 1 block.
        let strict = update_consensus(&proposed, &voters, table.total(), 0.8).unwrap();
        assert_eq!(strict.consensus_point(), 1);
    }
}
