//! Outbound belief propagation.
//!
//! When to broadcast is decided by the node state machine (minimum delay
//! between broadcasts, rebroadcast of an unchanged belief). The propagator
//! turns each `Action::Broadcast` into one encoded frame, hands it to the
//! transport and keeps delivery statistics.

use crate::metrics;
use crate::network::{encode_message, CodecError, Delivery, Frame, GossipTransport};
use cpos_core::OutboundMessage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagatorStats {
    pub broadcasts: u64,
    pub last_broadcast: Option<Instant>,
    /// Per-peer deliveries that failed because the recipient could not
    /// take the frame.
    pub dropped: u64,
}

pub struct BeliefPropagator {
    transport: Arc<dyn GossipTransport>,
    stats: PropagatorStats,
}

impl BeliefPropagator {
    pub fn new(transport: Arc<dyn GossipTransport>) -> Self {
        Self {
            transport,
            stats: PropagatorStats::default(),
        }
    }

    pub fn stats(&self) -> PropagatorStats {
        self.stats
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peer_count()
    }

    /// Encode and send `message` to all peers.
    ///
    /// Delivery failures are counted, never retried; the next broadcast
    /// supersedes this one.
    pub fn broadcast(&mut self, message: &OutboundMessage) -> Result<Delivery, CodecError> {
        let frame: Frame = encode_message(message)?.into();
        let size = frame.len();
        let delivery = self.transport.broadcast(frame);

        self.stats.broadcasts += 1;
        self.stats.last_broadcast = Some(Instant::now());
        self.stats.dropped += delivery.failed as u64;

        if delivery.failed > 0 {
            metrics::record_delivery_failures(delivery.failed);
            warn!(
                msg_type = message.type_name(),
                delivered = delivery.delivered,
                failed = delivery.failed,
                "Belief not delivered to every peer"
            );
        } else {
            debug!(
                msg_type = message.type_name(),
                delivered = delivery.delivered,
                size,
                "Broadcast belief"
            );
        }
        Ok(delivery)
    }
}
