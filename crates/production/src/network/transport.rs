//! Gossip transport.
//!
//! The runner only needs fire-and-forget broadcast of encoded frames plus an
//! inbound frame queue. [`LocalHub`] connects runners in one process, which
//! is what the node binary and the integration tests use.

use cpos_types::PeerKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// An encoded gossip message shared between all recipients.
pub type Frame = Arc<[u8]>;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Peers whose inbound queue was full or closed. Not retried.
    pub failed: usize,
}

/// Sends frames to every connected peer.
///
/// Implementations must not block: a peer that cannot take the frame right
/// now counts as a failed delivery.
pub trait GossipTransport: Send + Sync {
    fn broadcast(&self, frame: Frame) -> Delivery;

    fn peer_count(&self) -> usize;
}

/// In-process gossip hub.
///
/// Every connected peer owns a bounded inbound queue. Broadcasting fans the
/// frame out to all other peers with `try_send`.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    inboxes: Arc<RwLock<HashMap<PeerKey, mpsc::Sender<Frame>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `peer` with an inbound queue of `capacity` frames.
    ///
    /// Reconnecting replaces the previous queue.
    pub fn connect(&self, peer: PeerKey, capacity: usize) -> (LocalTransport, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inboxes.write().insert(peer, tx);
        let transport = LocalTransport {
            hub: self.clone(),
            local: peer,
        };
        (transport, rx)
    }

    pub fn disconnect(&self, peer: &PeerKey) {
        self.inboxes.write().remove(peer);
    }

    pub fn len(&self) -> usize {
        self.inboxes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.read().is_empty()
    }
}

/// One peer's handle on a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    hub: LocalHub,
    local: PeerKey,
}

impl GossipTransport for LocalTransport {
    fn broadcast(&self, frame: Frame) -> Delivery {
        let inboxes = self.hub.inboxes.read();
        let mut delivery = Delivery::default();
        for (peer, inbox) in inboxes.iter().filter(|(peer, _)| **peer != self.local) {
            match inbox.try_send(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    trace!(%peer, "Inbound queue full");
                    delivery.failed += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(%peer, "Inbound queue closed");
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }

    fn peer_count(&self) -> usize {
        self.hub.len().saturating_sub(1)
    }
}
