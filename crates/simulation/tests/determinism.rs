//! Tests for deterministic simulation.
//!
//! The same seed must produce the same run, event for event.

use cpos_simulation::{SimulationConfig, SimulationRunner};
use std::time::Duration;

fn lossy_config() -> SimulationConfig {
    let mut config = SimulationConfig::with_stakes(vec![40, 25, 20, 15]);
    config.network.packet_loss_rate = 0.1;
    config.network.jitter_fraction = 0.3;
    config
}

fn run(seed: u64) -> SimulationRunner {
    let mut runner = SimulationRunner::new(lossy_config(), seed);
    runner.initialize();
    for round in 0..3u64 {
        for node in 0..4 {
            runner.submit_block(node, Duration::from_millis(100 + 300 * round));
        }
    }
    runner.run_until(Duration::from_secs(20));
    runner
}

#[test]
fn test_runner_creation() {
    let runner = SimulationRunner::new(SimulationConfig::default(), 42);
    assert!(runner.node(3).is_some());
    assert!(runner.node(4).is_none());
    assert_eq!(runner.network().all_nodes().len(), 4);
}

#[test]
fn test_same_seed_same_run() {
    let first = run(12345);
    let second = run(12345);

    let (a, b) = (first.stats(), second.stats());
    assert_eq!(a.events_processed, b.events_processed);
    assert_eq!(a.actions_generated, b.actions_generated);
    assert_eq!(a.messages_sent, b.messages_sent);
    assert_eq!(a.messages_dropped_loss, b.messages_dropped_loss);
    assert_eq!(a.timers_set, b.timers_set);

    for (x, y) in first.nodes().iter().zip(second.nodes()) {
        assert_eq!(x.stats(), y.stats());
        assert_eq!(x.peer().to_data(), y.peer().to_data());
    }
}

#[test]
fn test_final_state_is_the_same_on_every_node() {
    let runner = run(99);
    let reference = runner.node(0).unwrap().peer();
    assert_eq!(reference.state_position(), 12);
    for node in runner.nodes() {
        assert_eq!(node.peer().consensus_state(), reference.consensus_state());
    }
}
