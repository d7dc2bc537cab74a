//! External transport contracts: the callbacks the surrounding router
//! supplies, called by the egress loop and the edge-uplink resolution
//! step. This crate only ever calls through these traits; it never
//! performs framing, encoding, or socket I/O itself.

use std::sync::Arc;

use crate::connection::EdgeConnAddr;
use crate::delivery::Delivery;
use crate::link::Link;

/// Transmits (or continues transmitting) one delivery on an outgoing
/// link, returning a non-zero disposition to propagate or `0` for no
/// change.
pub trait DeliverHandler: Send + Sync {
    fn deliver(&self, link: &Arc<Link>, delivery: &Arc<Delivery>, settled: bool) -> u64;
}

/// Informs the peer how many deliveries remain queued after an egress
/// pass; purely informational.
pub trait OfferHandler: Send + Sync {
    fn offer(&self, link: &Arc<Link>, remaining_outbound_count: usize);
}

/// Resolves the local proxy address representing this router's edge
/// uplink, if any; its presence is the signal that this process is acting
/// as an edge router.
pub trait EdgeUplink: Send + Sync {
    fn edge_conn_addr(&self) -> Option<EdgeConnAddr>;
}

/// A [`DeliverHandler`]/[`OfferHandler`] test double that records every
/// call instead of touching a socket, used by this crate's own
/// integration tests.
#[derive(Default)]
pub struct RecordingTransport {
    pub delivered: parking_lot::Mutex<Vec<(String, bool)>>,
    pub offers: parking_lot::Mutex<Vec<(String, usize)>>,
    /// Disposition to return from every `deliver` call; `0` by default.
    pub next_disposition: std::sync::atomic::AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_next_disposition(&self, disposition: u64) {
        self.next_disposition
            .store(disposition, std::sync::atomic::Ordering::Relaxed);
    }
}

impl DeliverHandler for RecordingTransport {
    fn deliver(&self, link: &Arc<Link>, _delivery: &Arc<Delivery>, settled: bool) -> u64 {
        self.delivered.lock().push((link.name.clone(), settled));
        self.next_disposition
            .swap(0, std::sync::atomic::Ordering::Relaxed)
    }
}

impl OfferHandler for RecordingTransport {
    fn offer(&self, link: &Arc<Link>, remaining_outbound_count: usize) {
        self.offers.lock().push((link.name.clone(), remaining_outbound_count));
    }
}
