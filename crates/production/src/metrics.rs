//! Production metrics using native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use cpos_node::NodeStats;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Consensus ===
    pub merges: Counter,
    pub merge_latency: Histogram,
    pub consensus_point: Gauge,
    pub state_position: Gauge,
    pub receding_finality: Counter,
    pub forks: Counter,
    pub consensus_stopped: Gauge,

    // === Propagation ===
    pub beliefs_broadcast: Counter,
    pub belief_rebroadcasts: Counter,
    pub broadcast_delivery_failures: Counter,
    pub beliefs_received: Counter,
    pub belief_batch_size: Histogram,
    pub foreign_beliefs: Counter,

    // === Blocks ===
    pub blocks_submitted: Counter,
    pub blocks_rejected: Counter,

    // === Storage ===
    pub checkpoints_written: Counter,
    pub checkpoint_failures: Counter,
    pub rocksdb_read_latency: Histogram,
    pub rocksdb_write_latency: Histogram,

    // === Errors ===
    pub invalid_messages_received: Counter,
}

impl Metrics {
    fn new() -> Self {
        let latency_buckets = vec![
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
        ];

        Self {
            merges: register_counter!("cpos_merges_total", "Belief merges performed")
                .expect("metric registration"),

            merge_latency: register_histogram!(
                "cpos_merge_latency_seconds",
                "Time to merge a belief batch and advance state",
                latency_buckets.clone()
            )
            .expect("metric registration"),

            consensus_point: register_gauge!(
                "cpos_consensus_point",
                "Consensus point of the own order"
            )
            .expect("metric registration"),

            state_position: register_gauge!(
                "cpos_state_position",
                "Number of agreed blocks applied to ledger state"
            )
            .expect("metric registration"),

            receding_finality: register_counter!(
                "cpos_receding_finality_total",
                "Merges that lowered the own consensus point"
            )
            .expect("metric registration"),

            forks: register_counter!(
                "cpos_forks_total",
                "State advancements that rolled back applied history"
            )
            .expect("metric registration"),

            consensus_stopped: register_gauge!(
                "cpos_consensus_stopped",
                "Whether consensus stopped after a fatal error (0 or 1)"
            )
            .expect("metric registration"),

            beliefs_broadcast: register_counter!(
                "cpos_beliefs_broadcast_total",
                "Beliefs broadcast to peers"
            )
            .expect("metric registration"),

            belief_rebroadcasts: register_counter!(
                "cpos_belief_rebroadcasts_total",
                "Periodic broadcasts of an unchanged belief"
            )
            .expect("metric registration"),

            broadcast_delivery_failures: register_counter!(
                "cpos_broadcast_delivery_failures_total",
                "Belief deliveries dropped because a peer's inbound queue was full or closed"
            )
            .expect("metric registration"),

            beliefs_received: register_counter!(
                "cpos_beliefs_received_total",
                "Beliefs received from peers"
            )
            .expect("metric registration"),

            belief_batch_size: register_histogram!(
                "cpos_belief_batch_size",
                "Beliefs absorbed per merge",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0]
            )
            .expect("metric registration"),

            foreign_beliefs: register_counter!(
                "cpos_foreign_beliefs_total",
                "Beliefs dropped because they belong to another network"
            )
            .expect("metric registration"),

            blocks_submitted: register_counter!(
                "cpos_blocks_submitted_total",
                "Blocks submitted for proposal"
            )
            .expect("metric registration"),

            blocks_rejected: register_counter!(
                "cpos_blocks_rejected_total",
                "Submitted blocks dropped for lack of stake"
            )
            .expect("metric registration"),

            checkpoints_written: register_counter!(
                "cpos_checkpoints_written_total",
                "Peer checkpoints persisted"
            )
            .expect("metric registration"),

            checkpoint_failures: register_counter!(
                "cpos_checkpoint_failures_total",
                "Peer checkpoints that failed to persist"
            )
            .expect("metric registration"),

            rocksdb_read_latency: register_histogram!(
                "cpos_rocksdb_read_latency_seconds",
                "RocksDB read operation latency",
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
            )
            .expect("metric registration"),

            rocksdb_write_latency: register_histogram!(
                "cpos_rocksdb_write_latency_seconds",
                "RocksDB write operation latency",
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
            )
            .expect("metric registration"),

            invalid_messages_received: register_counter!(
                "cpos_invalid_messages_received_total",
                "Gossip frames that failed to decode"
            )
            .expect("metric registration"),
        }
    }
}

/// Get or initialize the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Record a merge of `batch` beliefs.
pub fn record_merge(batch: usize, latency_secs: f64) {
    let m = metrics();
    m.beliefs_received.inc_by(batch as f64);
    m.belief_batch_size.observe(batch as f64);
    m.merge_latency.observe(latency_secs);
}

/// Update consensus progress gauges.
pub fn set_consensus_progress(consensus_point: usize, state_position: usize) {
    let m = metrics();
    m.consensus_point.set(consensus_point as f64);
    m.state_position.set(state_position as f64);
}

/// Mirror node counters into Prometheus.
///
/// Node statistics are cumulative; only the growth since `before` is added.
pub fn record_node_stats(before: &NodeStats, after: &NodeStats) {
    let m = metrics();
    let delta = |a: u64, b: u64| b.saturating_sub(a) as f64;
    m.merges.inc_by(delta(before.merges, after.merges));
    m.beliefs_broadcast.inc_by(delta(before.broadcasts, after.broadcasts));
    m.belief_rebroadcasts.inc_by(delta(before.rebroadcasts, after.rebroadcasts));
    m.foreign_beliefs.inc_by(delta(before.foreign_beliefs, after.foreign_beliefs));
    m.receding_finality.inc_by(delta(before.receding_finality, after.receding_finality));
    m.forks.inc_by(delta(before.forks, after.forks));
    m.blocks_rejected.inc_by(delta(before.rejected_blocks, after.rejected_blocks));
}

pub fn record_block_submitted() {
    metrics().blocks_submitted.inc();
}

pub fn record_delivery_failures(count: usize) {
    metrics().broadcast_delivery_failures.inc_by(count as f64);
}

pub fn record_checkpoint_written() {
    metrics().checkpoints_written.inc();
}

pub fn record_checkpoint_failure() {
    metrics().checkpoint_failures.inc();
}

pub fn set_consensus_stopped(stopped: bool) {
    metrics().consensus_stopped.set(if stopped { 1.0 } else { 0.0 });
}

pub fn record_rocksdb_read(latency_secs: f64) {
    metrics().rocksdb_read_latency.observe(latency_secs);
}

pub fn record_rocksdb_write(latency_secs: f64) {
    metrics().rocksdb_write_latency.observe(latency_secs);
}

pub fn record_invalid_message() {
    metrics().invalid_messages_received.inc();
}
