//! The connection-facing side of the work-lock / proactor-token split
//! this crate uses to realize a per-connection serialization guarantee.
//!
//! Per-link delivery/work queues are shared between the core thread and
//! the owning connection's I/O thread. The originating design protects
//! them with a single per-connection `work_lock`, plus a "proactor token"
//! obtained from the connection's event loop that guarantees at most one
//! I/O handler runs per connection at a time. This crate keeps both ideas
//! but splits the lock in two: the hot, per-link queue/flow state lives
//! behind each [`crate::link::Link`]'s own lock (see
//! [`crate::link::LinkMutable`]), while `Connection::work` here holds only
//! the lighter, connection-wide "which links have pending work" index.
//! [`ConnectionToken`] plays the role of the proactor token: it can only
//! be constructed by locking `Connection::io_lock`, so a function that
//! requires one as a parameter cannot be called by two I/O handlers for
//! the same connection concurrently.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::link::LinkHandle;

/// A connection's router-wide identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

/// The role a connection plays, relevant to forwarding decisions that
/// distinguish edge uplinks from ordinary endpoint connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionRole {
    /// An ordinary client/broker endpoint connection.
    #[default]
    Normal,
    /// An inter-router connection.
    InterRouter,
    /// An edge router's uplink to its interior parent.
    EdgeUplink,
}

/// The address a link should be connected to via an edge uplink, when a
/// treatment calls for edge-forwarding. Opaque to this crate; it only ever
/// hands the value back to a [`crate::transport`] implementor.
#[derive(Debug, Clone)]
pub struct EdgeConnAddr(pub String);

/// Links with pending work, grouped by priority, and drained
/// lowest-priority-first by the I/O thread. Kept separate from each
/// link's own queue lock so that adding an entry doesn't require locking
/// every other link on the connection.
#[derive(Debug, Default)]
pub struct ConnectionWork {
    by_priority: std::collections::BTreeMap<u8, BTreeSet<LinkHandleKey>>,
}

/// `LinkHandle` isn't `Ord` (it doesn't need to be anywhere else); this
/// newtype gives `ConnectionWork` a stable iteration order without
/// exposing ordering on the handle type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LinkHandleKey(usize, u64);

impl From<LinkHandle> for LinkHandleKey {
    fn from(h: LinkHandle) -> Self {
        LinkHandleKey(h.key, h.generation)
    }
}

impl ConnectionWork {
    /// Record that `link` has work pending at `priority` (lower values
    /// drain first).
    pub fn add(&mut self, link: LinkHandle, priority: u8) {
        self.by_priority.entry(priority).or_default().insert(link.into());
    }

    /// `true` if any link has pending work.
    pub fn has_work(&self) -> bool {
        self.by_priority.values().any(|s| !s.is_empty())
    }
}

/// A proof of exclusive access to one connection's I/O handling, obtained
/// by locking [`Connection::io_lock`]. Functions that must not run
/// concurrently for the same connection take `&ConnectionToken` so the
/// compiler (not a runtime check) enforces that the caller is holding it.
pub struct ConnectionToken<'a> {
    _guard: parking_lot::MutexGuard<'a, ()>,
}

/// A connection: the shared, cross-thread state this crate needs to
/// schedule link work and wake the owning I/O thread. Transport framing,
/// socket I/O, and AMQP performative encode/decode all live outside this
/// crate, behind the traits in [`crate::transport`].
pub struct Connection {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub edge_addr: Option<EdgeConnAddr>,
    pub(crate) work: Mutex<ConnectionWork>,
    io_lock: Mutex<()>,
    activate_calls: AtomicU64,
    activate_fn: Box<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish()
    }
}

impl Connection {
    /// Construct a connection. `activate_fn` is called whenever core-thread
    /// processing produces work this connection's I/O thread should wake
    /// up and drain; in a full router it wakes the transport's event loop,
    /// here it is supplied by the embedder (tests use a counting closure).
    pub fn new(
        id: ConnectionId,
        role: ConnectionRole,
        edge_addr: Option<EdgeConnAddr>,
        activate_fn: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            role,
            edge_addr,
            work: Mutex::new(ConnectionWork::default()),
            io_lock: Mutex::new(()),
            activate_calls: AtomicU64::new(0),
            activate_fn: Box::new(activate_fn),
        })
    }

    /// Record that `link` has pending work at `priority`.
    pub fn add_link_work(&self, link: LinkHandle, priority: u8) {
        self.work.lock().add(link, priority);
    }

    /// Wake this connection's I/O thread.
    pub fn activate(&self) {
        self.activate_calls.fetch_add(1, Ordering::Relaxed);
        (self.activate_fn)();
    }

    /// How many times [`Connection::activate`] has been called, for tests.
    pub fn activate_count(&self) -> u64 {
        self.activate_calls.load(Ordering::Relaxed)
    }

    /// Acquire the proactor token for this connection, blocking if another
    /// I/O handler currently holds it.
    pub fn io_token(&self) -> ConnectionToken<'_> {
        ConnectionToken {
            _guard: self.io_lock.lock(),
        }
    }

    /// `true` if any link on this connection has pending work.
    pub fn has_work(&self) -> bool {
        self.work.lock().has_work()
    }
}
