//! A link endpoint: direction, type, route binding, and the queues/flow
//! state shared with its connection's I/O thread.

pub mod queue;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::flow::LinkFlowCounters;
use queue::LinkQueues;

/// A weak, generation-tagged reference to a [`Link`] registered in a
/// [`crate::core::LinkTable`]: a plain index plus a generation counter,
/// validated against the table before use rather than dereferenced
/// directly. `dangling` exists only for tests that don't need to resolve
/// the handle through a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    pub(crate) key: usize,
    pub(crate) generation: u64,
}

impl LinkHandle {
    pub(crate) fn new(key: usize, generation: u64) -> Self {
        Self { key, generation }
    }

    /// A handle that will never resolve through any real
    /// [`crate::core::LinkTable`]; used by unit tests that only exercise
    /// queue/delivery bookkeeping.
    pub fn dangling() -> Self {
        Self {
            key: usize::MAX,
            generation: u64::MAX,
        }
    }
}

/// Direction of a link, relative to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Messages flow from the remote peer into the router.
    Incoming,
    /// Messages flow from the router out to the remote peer.
    Outgoing,
}

/// Link type. Only the variants this crate's decision trees inspect are
/// named; a full router's link-type enum is larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// A normal application endpoint link.
    Endpoint,
    /// The router's own control link.
    Control,
    /// A link to a peer router.
    Router,
}

/// Which of `core_endpoint` / `connected_link` / address-based routing
/// governs a link's ingress handling, computed once at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Delivered to a core-internal endpoint handler; no address
    /// resolution or forwarding happens.
    CoreEndpoint,
    /// Attach-routed straight through to a paired peer link.
    AttachRouted(LinkHandle),
    /// Ordinary address-based forwarding, via the named address (or none,
    /// if `to_addr` resolution is still pending).
    AddressRouted(Option<()>),
}

/// The core-thread-owned routing fields of a link: which address it owns
/// (if any), its attach-routed peer (if any), and whether it is bound to a
/// core-internal endpoint. Guarded by its own lock because, while only the
/// core thread ever mutates it, `Link` is reachable through `Arc` from
/// other threads and therefore must stay `Sync`.
#[derive(Debug, Default)]
pub struct RouteState {
    /// The address this link is attached to as a producer/consumer
    /// terminus, if any.
    pub owning_addr: Option<String>,
    /// Attach-routed peer link, if this link is attach-routed.
    pub connected_link: Option<LinkHandle>,
    /// `true` if this link is bound to a core-internal endpoint handler.
    pub core_endpoint: bool,
}

/// The mutable state shared between the core thread and this link's
/// connection's I/O thread: the delivery/work queues plus the flow
/// counters. Per-link lists are shared between the core thread and the
/// owning connection's I/O thread, and need a lock guarding both sides.
/// Here the lock lives on the `Link`
/// itself rather than physically inside `Connection`, to avoid a global
/// per-connection bottleneck across unrelated links; callers are expected
/// to treat it as part of that connection's work-lock domain (see
/// DESIGN.md).
#[derive(Debug, Default)]
pub struct LinkMutable {
    /// The four delivery/work queues.
    pub queues: LinkQueues,
    /// Credit/drain bookkeeping.
    pub flow: LinkFlowCounters,
    /// `true` once a Detach has been received; short-circuits the egress
    /// loop.
    pub detach_received: bool,
    /// `true` if the link is waiting for outbound work but has none right
    /// now.
    pub stalled_outbound: bool,
    /// `1` while only one side of the attach handshake has completed.
    pub attach_count: u8,
}

/// A link endpoint.
#[derive(Debug)]
pub struct Link {
    /// This link's own handle, as registered in the owning
    /// [`crate::core::LinkTable`]. Set once by
    /// [`crate::core::LinkTable::insert`]; [`LinkHandle::dangling`] until
    /// then.
    pub(crate) handle: LinkHandle,
    /// Direction relative to the router.
    pub direction: Direction,
    /// Link type.
    pub link_type: LinkType,
    /// Link name, as attached.
    pub name: String,
    /// `true` if this link terminates on an edge uplink connection.
    pub edge: bool,
    /// `true` if this link is itself acting as a fallback destination
    /// (fallback redirection never targets a link that is itself a
    /// fallback link).
    pub fallback: bool,
    /// The connection this link is attached over.
    pub connection: Arc<Connection>,
    pub(crate) route: Mutex<RouteState>,
    pub(crate) mutable: Mutex<LinkMutable>,
}

impl Link {
    /// Construct a new, unattached-to-a-table link. Callers register it
    /// with a [`crate::core::LinkTable`] to obtain its [`LinkHandle`].
    pub fn new(
        direction: Direction,
        link_type: LinkType,
        name: impl Into<String>,
        edge: bool,
        fallback: bool,
        connection: Arc<Connection>,
        capacity: u32,
    ) -> Self {
        Self {
            handle: LinkHandle::dangling(),
            direction,
            link_type,
            name: name.into(),
            edge,
            fallback,
            connection,
            route: Mutex::new(RouteState::default()),
            mutable: Mutex::new(LinkMutable {
                flow: LinkFlowCounters {
                    capacity,
                    ..Default::default()
                },
                ..Default::default()
            }),
        }
    }

    /// Bind this link to a core-internal endpoint.
    pub fn bind_core_endpoint(&self) {
        self.route.lock().core_endpoint = true;
    }

    /// Bind this link as attach-routed to `peer`.
    pub fn bind_connected_link(&self, peer: LinkHandle) {
        self.route.lock().connected_link = Some(peer);
    }

    /// Bind this link's owning address.
    pub fn set_owning_addr(&self, addr: Option<String>) {
        self.route.lock().owning_addr = addr;
    }

    /// This link's owning address, if set.
    pub fn owning_addr(&self) -> Option<String> {
        self.route.lock().owning_addr.clone()
    }

    /// Resolve which routing mode governs this link: `core_endpoint` wins
    /// over `connected_link` if, unexpectedly, both are set.
    pub fn route_kind(&self) -> RouteKind {
        let route = self.route.lock();
        if route.core_endpoint {
            if route.connected_link.is_some() {
                tracing::warn!(link = ?self.handle, "link has both core_endpoint and connected_link set; core_endpoint wins");
            }
            RouteKind::CoreEndpoint
        } else if let Some(peer) = route.connected_link {
            RouteKind::AttachRouted(peer)
        } else {
            RouteKind::AddressRouted(None)
        }
    }

    /// Lock the shared queue/flow state. See [`LinkMutable`] for the
    /// locking-domain note.
    pub fn lock_mutable(&self) -> parking_lot::MutexGuard<'_, LinkMutable> {
        self.mutable.lock()
    }

    /// This link's handle, as registered in its [`crate::core::LinkTable`].
    pub fn handle(&self) -> LinkHandle {
        self.handle
    }
}
