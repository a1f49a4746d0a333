//! Gossip links between simulated peers.
//!
//! Every belief broadcast becomes one delivery per link. A delivery is lost
//! if its link is cut or the loss roll fails, otherwise it arrives after a
//! seeded delay around the configured latency.

use cpos_node::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Link behavior shared by every pair of peers.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub num_nodes: u32,
    /// Typical one-way delay of a belief delivery.
    pub latency: Duration,
    /// Spread of the delay around `latency`, as a fraction of it.
    pub jitter_fraction: f64,
    /// Probability that a single delivery is lost.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            latency: Duration::from_millis(100),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Gossip links with cut sets, loss and delay.
///
/// Cuts are directed: cutting `a -> b` still lets `b` reach `a`.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    cut: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            cut: HashSet::new(),
        }
    }

    pub fn is_cut(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.cut.contains(&(from, to))
    }

    /// Stop beliefs from `from` reaching `to`.
    pub fn cut_link(&mut self, from: NodeIndex, to: NodeIndex) {
        self.cut.insert((from, to));
    }

    /// Cut every link between the two groups, both ways.
    pub fn partition_groups(&mut self, group_a: &[NodeIndex], group_b: &[NodeIndex]) {
        for &a in group_a {
            for &b in group_b {
                self.cut_link(a, b);
                self.cut_link(b, a);
            }
        }
    }

    /// Cut a peer off from everyone else.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        let others: Vec<NodeIndex> = self.all_nodes().filter(|&n| n != node).collect();
        self.partition_groups(&[node], &others);
    }

    pub fn heal_all(&mut self) {
        self.cut.clear();
    }

    pub fn cut_links(&self) -> usize {
        self.cut.len()
    }

    /// Roll for loss of one delivery. Draws nothing when loss is disabled.
    pub fn drops_delivery(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn packet_loss_rate(&self) -> f64 {
        self.config.packet_loss_rate
    }

    /// Delay of one delivery, never below a millisecond.
    pub fn delivery_delay(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let spread = base * self.config.jitter_fraction;
        let offset = if spread > 0.0 {
            rng.gen_range(-spread..spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.001))
    }

    /// Upper bound of [`delivery_delay`](Self::delivery_delay).
    pub fn max_delivery_delay(&self) -> Duration {
        self.config
            .latency
            .mul_f64(1.0 + self.config.jitter_fraction.max(0.0))
            .max(Duration::from_millis(1))
    }

    pub fn all_nodes(&self) -> std::ops::Range<NodeIndex> {
        0..self.config.num_nodes
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_delivery_delay_is_seeded_and_bounded() {
        let network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..10 {
            let delay = network.delivery_delay(&mut rng1);
            assert_eq!(delay, network.delivery_delay(&mut rng2));
            assert!(delay >= Duration::from_millis(90));
            assert!(delay <= network.max_delivery_delay());
        }
        assert!(network.max_delivery_delay() > Duration::from_millis(109));
    }

    #[test]
    fn test_partitioned_groups_keep_internal_links() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.partition_groups(&[0, 1], &[2, 3]);

        assert!(network.is_cut(0, 2));
        assert!(network.is_cut(3, 1));
        assert!(!network.is_cut(0, 1));
        assert!(!network.is_cut(2, 3));
        assert_eq!(network.cut_links(), 8);

        network.heal_all();
        assert_eq!(network.cut_links(), 0);
    }

    #[test]
    fn test_isolated_peer_is_cut_both_ways() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.isolate_node(0);
        for other in 1..4 {
            assert!(network.is_cut(0, other));
            assert!(network.is_cut(other, 0));
        }
        assert!(!network.is_cut(1, 2));
    }

    #[test]
    fn test_cut_link_is_directed() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.cut_link(0, 1);
        assert!(network.is_cut(0, 1));
        assert!(!network.is_cut(1, 0));
    }

    #[test]
    fn test_loss_rate_is_respected_and_clamped() {
        let mut network = SimulatedNetwork::new(NetworkConfig {
            packet_loss_rate: 0.5,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let lost = (0..10_000)
            .filter(|_| network.drops_delivery(&mut rng))
            .count();
        let rate = lost as f64 / 10_000.0;
        assert!((0.45..0.55).contains(&rate), "loss rate {rate}");

        network.set_packet_loss_rate(1.5);
        assert_eq!(network.packet_loss_rate(), 1.0);
        network.set_packet_loss_rate(-0.5);
        assert_eq!(network.packet_loss_rate(), 0.0);
    }
}
