//! The delivery object and its list-membership discipline (component C1).
//!
//! A hand-counted-reference design would have every list that holds a
//! delivery own exactly one reference, with `where` recording which list (if
//! any) currently owns it. This crate keeps the `where` bookkeeping, since
//! "where matches list membership" is an independently testable invariant,
//! but replaces the hand-counted reference with `Arc`: a list owns a
//! delivery by holding an `Arc<Delivery>` clone, and dropping that clone
//! *is* the decref. `Arc::strong_count` is then exactly "number of owning
//! lists + number of live action/local references".

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CoreError, DeliveryError};
use crate::link::{Link, LinkHandle};
use crate::message::Message;

/// Maximum length, in bytes, of a delivery tag.
pub const QDR_DELIVERY_TAG_MAX: usize = 32;

/// AMQP delivery-state disposition codes this crate produces directly.
/// Not an exhaustive encoding of `Outcome` -- just the values the
/// forwarding decision tree sets.
pub mod disposition {
    /// `accepted`
    pub const ACCEPTED: u64 = 0x24;
    /// `rejected`
    pub const REJECTED: u64 = 0x25;
    /// `released`
    pub const RELEASED: u64 = 0x26;
    /// `modified`
    pub const MODIFIED: u64 = 0x27;
}

/// A delivery tag, capped at [`QDR_DELIVERY_TAG_MAX`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct DeliveryTag {
    buf: [u8; QDR_DELIVERY_TAG_MAX],
    len: u8,
}

impl DeliveryTag {
    /// Build a tag, rejecting anything longer than [`QDR_DELIVERY_TAG_MAX`].
    pub fn new(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() > QDR_DELIVERY_TAG_MAX {
            return Err(CoreError::TagTooLong(bytes.len()));
        }
        let mut buf = [0u8; QDR_DELIVERY_TAG_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            buf,
            len: bytes.len() as u8,
        })
    }

    /// The tag bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

impl fmt::Debug for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeliveryTag").field(&self.as_slice()).finish()
    }
}

/// Which of a link's lists, if any, currently owns this delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Where {
    /// Not owned by any list (either fresh, or already released/settled and
    /// about to be dropped).
    Nowhere,
    /// Owned by an in-flight [`crate::action::Action`].
    Action,
    /// Queued on the link's `undelivered` list, awaiting transmission.
    Undelivered,
    /// Moved to `unsettled` after a successful, unsettled transmission.
    Unsettled,
    /// Moved to `settled` -- used only to keep a streaming, presettled,
    /// multicast delivery's peer linkage alive.
    Settled,
    /// Observed in a state this crate's bookkeeping did not expect; logged,
    /// never silently asserted away.
    Unknown,
}

/// The in-router representation of one AMQP transfer, from the point it is
/// handed to the core thread until it is settled or released.
pub struct Delivery {
    message: Mutex<Box<dyn Message>>,
    /// Address the delivery originated from, if known.
    pub origin: Option<String>,
    /// `to` field of the original transfer, before any rewrite.
    pub to_addr: Option<String>,
    settled: AtomicBool,
    /// Whether the delivery arrived pre-settled.
    pub presettled: bool,
    multicast: AtomicBool,
    /// Whether this delivery arrived over (or is being forwarded via) an
    /// edge uplink. Stamped once, on ingress, by the core thread.
    via_edge: AtomicBool,
    /// Links excluded from fanout (e.g. the ingress link itself, for
    /// loop prevention), as a bitmask over some router-wide link index.
    pub link_exclusion: Option<u64>,
    /// Monotonically increasing index assigned at ingress.
    pub ingress_index: u32,
    /// Core-thread monotonic tick at which this delivery was stamped.
    /// `0` until [`Delivery::stamp_ingress_time`] runs.
    ingress_time: AtomicU64,
    disposition: AtomicU64,
    error: Mutex<Option<DeliveryError>>,
    /// Delivery tag, copied verbatim across attach-routed peers.
    pub tag: DeliveryTag,
    /// Weak, generation-validated reference to the owning link.
    pub link: LinkHandle,
    where_: Mutex<Where>,
    /// Peers created for multicast fanout, kept alive only long enough to
    /// propagate settlement: a streaming, presettled, multicast delivery is
    /// held in `settled` for exactly this reason.
    peers: Mutex<Vec<Arc<Delivery>>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("origin", &self.origin)
            .field("to_addr", &self.to_addr)
            .field("settled", &self.is_settled())
            .field("presettled", &self.presettled)
            .field("multicast", &self.is_multicast())
            .field("where", &self.where_tag())
            .field("tag", &self.tag)
            .finish()
    }
}

impl Delivery {
    /// Construct a fresh delivery. A newly created delivery conceptually
    /// starts referenced from two places: the action that carries it, and
    /// the caller. With `Arc` that's simply `Arc::new` handed to both --
    /// there is no separate count to track.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message: Box<dyn Message>,
        origin: Option<String>,
        to_addr: Option<String>,
        presettled: bool,
        via_edge: bool,
        ingress_index: u32,
        ingress_time: u64,
        tag: DeliveryTag,
        link: LinkHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            message: Mutex::new(message),
            origin,
            to_addr,
            settled: AtomicBool::new(presettled),
            presettled,
            multicast: AtomicBool::new(false),
            via_edge: AtomicBool::new(via_edge),
            link_exclusion: None,
            ingress_index,
            ingress_time: AtomicU64::new(ingress_time),
            disposition: AtomicU64::new(0),
            error: Mutex::new(None),
            tag,
            link,
            where_: Mutex::new(Where::Action),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Create an independent peer delivery for fanout, copying the message
    /// body and preserving the tag verbatim.
    pub fn copy_for_peer(&self, link: LinkHandle) -> Arc<Delivery> {
        let message = self.message.lock().copy();
        Arc::new(Delivery {
            message: Mutex::new(message),
            origin: self.origin.clone(),
            to_addr: self.to_addr.clone(),
            settled: AtomicBool::new(self.presettled),
            presettled: self.presettled,
            multicast: AtomicBool::new(self.is_multicast()),
            via_edge: AtomicBool::new(self.via_edge()),
            link_exclusion: self.link_exclusion,
            ingress_index: self.ingress_index,
            ingress_time: AtomicU64::new(self.ingress_time()),
            disposition: AtomicU64::new(0),
            error: Mutex::new(None),
            tag: self.tag.clone(),
            link,
            where_: Mutex::new(Where::Action),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Record `peer` as a fanout copy of `self`, for later settlement
    /// propagation.
    pub fn add_peer(&self, peer: Arc<Delivery>) {
        self.peers.lock().push(peer);
    }

    /// Peers recorded via [`Delivery::add_peer`].
    pub fn peers(&self) -> Vec<Arc<Delivery>> {
        self.peers.lock().clone()
    }

    /// Run `f` with exclusive access to the message handle.
    pub fn with_message_mut<R>(&self, f: impl FnOnce(&mut dyn Message) -> R) -> R {
        f(&mut **self.message.lock())
    }

    /// `true` once the underlying message has been fully received.
    pub fn send_complete(&self) -> bool {
        self.message.lock().receive_complete()
    }

    /// Current `where` tag.
    pub fn where_tag(&self) -> Where {
        *self.where_.lock()
    }

    /// Overwrite the `where` tag. Callers are expected to call this exactly
    /// once per list transition: a transition between lists neither increfs
    /// nor decrefs -- the existing ref is simply handed over.
    pub fn set_where(&self, w: Where) {
        *self.where_.lock() = w;
    }

    /// `true` if this delivery has been settled (locally or via peer
    /// propagation).
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Mark the delivery settled (`settled ⇒ presettled ∨
    /// settled-by-peer-propagation`). This is the single place settlement
    /// is latched; it is idempotent.
    pub fn set_settled(&self, settled: bool) {
        self.settled.store(settled, Ordering::Release);
    }

    /// `true` if this delivery is part of a multicast fanout.
    pub fn is_multicast(&self) -> bool {
        self.multicast.load(Ordering::Acquire)
    }

    /// Set the multicast flag, derived from the resolved address's
    /// treatment.
    pub fn set_multicast(&self, multicast: bool) {
        self.multicast.store(multicast, Ordering::Release);
    }

    /// Current disposition code (0 means "no disposition set").
    pub fn disposition(&self) -> u64 {
        self.disposition.load(Ordering::Acquire)
    }

    /// Update the disposition code.
    pub fn set_disposition(&self, disposition: u64) {
        self.disposition.store(disposition, Ordering::Release);
    }

    /// `true` if this delivery arrived over, or is being forwarded via, an
    /// edge uplink.
    pub fn via_edge(&self) -> bool {
        self.via_edge.load(Ordering::Acquire)
    }

    /// Stamp the edge-uplink flag. Called once, on ingress.
    pub fn set_via_edge(&self, via_edge: bool) {
        self.via_edge.store(via_edge, Ordering::Release);
    }

    /// The core-thread tick this delivery was ingested at.
    pub fn ingress_time(&self) -> u64 {
        self.ingress_time.load(Ordering::Acquire)
    }

    /// Stamp the ingress tick. Called once, on ingress.
    pub fn stamp_ingress_time(&self, tick: u64) {
        self.ingress_time.store(tick, Ordering::Release);
    }

    /// The local error record, if any.
    pub fn error(&self) -> Option<DeliveryError> {
        self.error.lock().clone()
    }

    /// Attach a local error record.
    pub fn set_error(&self, error: DeliveryError) {
        *self.error.lock() = Some(error);
    }

    /// Clear the local error record.
    pub fn clear_error(&self) {
        *self.error.lock() = None;
    }
}

/// Core-side settlement update for a delivery that just finished
/// transmitting: sets `disposition`, marks the delivery settled, clears
/// any local error record, removes it from `link`'s `unsettled` list if
/// it is there, and propagates settlement to every peer recorded via
/// [`Delivery::add_peer`]. A peer only needs its `settled` bit flipped
/// here -- each peer is independently drained from (and removed from the
/// unsettled list of) its own outgoing link by that link's own
/// `egress::process_deliveries` pass.
pub fn update_disposition_ct(link: &Link, delivery: &Arc<Delivery>, disposition: u64) {
    delivery.set_disposition(disposition);
    delivery.set_settled(true);
    delivery.clear_error();

    let mut mutable = link.lock_mutable();
    if mutable.queues.remove_unsettled(delivery.tag.as_slice()).is_some() {
        drop(mutable);
        delivery.set_where(Where::Nowhere);
    }

    for peer in delivery.peers() {
        peer.set_settled(true);
    }
}
