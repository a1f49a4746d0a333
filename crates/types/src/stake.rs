//! Stake snapshots.

use crate::PeerKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable stake snapshot: peer identity to voting weight.
///
/// Captured once per merge; changes to ledger stake are observed on the next
/// round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeTable {
    stakes: BTreeMap<PeerKey, u64>,
    total: u64,
}

impl StakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stake of `peer`, zero when absent.
    pub fn stake(&self, peer: &PeerKey) -> u64 {
        self.stakes.get(peer).copied().unwrap_or(0)
    }

    /// Sum of all stakes.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerKey, u64)> {
        self.stakes.iter().map(|(k, v)| (k, *v))
    }

    /// Copy with `peer` set to `stake`. A zero stake removes the entry.
    pub fn with_stake(&self, peer: PeerKey, stake: u64) -> Self {
        let mut stakes = self.stakes.clone();
        if stake == 0 {
            stakes.remove(&peer);
        } else {
            stakes.insert(peer, stake);
        }
        Self::from_map(stakes)
    }

    fn from_map(stakes: BTreeMap<PeerKey, u64>) -> Self {
        let total = stakes.values().fold(0u64, |acc, s| acc.saturating_add(*s));
        StakeTable { stakes, total }
    }
}

impl FromIterator<(PeerKey, u64)> for StakeTable {
    fn from_iter<I: IntoIterator<Item = (PeerKey, u64)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().filter(|(_, s)| *s > 0).collect())
    }
}

/// Whether `stake` strictly exceeds `total * threshold`.
pub fn exceeds_threshold(stake: u64, total: u64, threshold: f64) -> bool {
    stake as f64 > total as f64 * threshold
}
