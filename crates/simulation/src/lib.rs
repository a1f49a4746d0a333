//! Deterministic simulation of CPoS networks.
//!
//! The [`SimulationRunner`] drives a set of [`cpos_node::NodeStateMachine`]s
//! from a single ordered event queue. Network latency, packet loss and
//! partitions are sampled from a seeded ChaCha8 RNG, so a run is fully
//! reproducible from its seed.

mod event_queue;
mod network;
mod runner;

pub use cpos_node::NodeIndex;
pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationConfig, SimulationRunner, SimulationStats};
