//! Deterministic event ordering.

use cpos_core::{Event, EventPriority};
use cpos_node::NodeIndex;
use std::time::Duration;

/// Key for the global event queue.
///
/// Events are ordered by time, then priority, then node, then insertion
/// sequence. The sequence makes every key unique and breaks remaining ties
/// in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node_index,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_same_time_orders_by_priority_then_node() {
        let t = Duration::from_millis(5);
        let mut queue = BTreeMap::new();
        queue.insert(EventKey::new(t, &Event::BeliefsReceived { beliefs: vec![] }, 0, 1), "network");
        queue.insert(EventKey::new(t, &Event::BroadcastTimer, 1, 2), "timer-1");
        queue.insert(EventKey::new(t, &Event::BroadcastTimer, 0, 3), "timer-0");
        queue.insert(EventKey::new(Duration::from_millis(1), &Event::CleanupTimer, 9, 4), "early");

        let order: Vec<_> = queue.values().copied().collect();
        assert_eq!(order, ["early", "timer-0", "timer-1", "network"]);
    }
}
