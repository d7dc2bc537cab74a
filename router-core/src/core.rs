//! The core thread: the process-wide context that owns the address table
//! and link table, drains the action queue, and dispatches to the
//! ingress/forwarder/flow components. Everything reachable from here is
//! mutated only on this one thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use slab::Slab;
use tracing::{instrument, trace, warn};

use crate::action::{ActionKind, ActionReceiver, ActionSender};
use crate::address::{Address, AddressTable};
use crate::config::CoreConfig;
use crate::flow::link_flow_ct;
use crate::forwarder::LinkResolver;
use crate::ingress::link_deliver_ct;
use crate::link::{Link, LinkHandle};
use crate::transport::{DeliverHandler, EdgeUplink, OfferHandler};

/// Core-wide counters exposed to operators, incremented only.
#[derive(Debug, Default)]
pub struct CoreStats {
    pub deliveries_ingress: AtomicU64,
    pub deliveries_ingress_route_container: AtomicU64,
    pub deliveries_redirected: AtomicU64,
    pub dropped_presettled_deliveries: AtomicU64,
    /// Number of times the non-empty-`undelivered` branch on ingress
    /// actually fired, instead of being silently asserted away.
    pub undelivered_race_observed: AtomicU64,
}

impl CoreStats {
    pub fn snapshot(&self) -> CoreStatsSnapshot {
        CoreStatsSnapshot {
            deliveries_ingress: self.deliveries_ingress.load(Ordering::Relaxed),
            deliveries_ingress_route_container: self
                .deliveries_ingress_route_container
                .load(Ordering::Relaxed),
            deliveries_redirected: self.deliveries_redirected.load(Ordering::Relaxed),
            dropped_presettled_deliveries: self.dropped_presettled_deliveries.load(Ordering::Relaxed),
            undelivered_race_observed: self.undelivered_race_observed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CoreStats`], for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStatsSnapshot {
    pub deliveries_ingress: u64,
    pub deliveries_ingress_route_container: u64,
    pub deliveries_redirected: u64,
    pub dropped_presettled_deliveries: u64,
    pub undelivered_race_observed: u64,
}

struct LinkSlot {
    link: Arc<Link>,
    generation: u64,
}

/// A slab-based table mapping [`LinkHandle`] to its live [`Link`]: a weak
/// handle (generation-tagged id + table lookup) validated before use. A
/// handle whose generation doesn't match the slot's current generation
/// refers to a link that has since been removed and its slot reused.
#[derive(Default)]
pub struct LinkTable {
    slots: Slab<LinkSlot>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `link`, stamping its [`LinkHandle`] before wrapping it in
    /// the `Arc` every other component will share.
    pub fn insert(&mut self, mut link: Link) -> LinkHandle {
        let entry = self.slots.vacant_entry();
        let generation = 0;
        let handle = LinkHandle::new(entry.key(), generation);
        link.handle = handle;
        entry.insert(LinkSlot {
            link: Arc::new(link),
            generation,
        });
        handle
    }

    /// Remove the link at `handle`, bumping its slot's generation so any
    /// stale handle fails to resolve afterward.
    pub fn remove(&mut self, handle: LinkHandle) -> Option<Arc<Link>> {
        let slot = self.slots.get_mut(handle.key)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        Some(self.slots.remove(handle.key).link)
    }

    pub fn get(&self, handle: LinkHandle) -> Option<Arc<Link>> {
        let slot = self.slots.get(handle.key)?;
        if slot.generation != handle.generation {
            return None;
        }
        Some(Arc::clone(&slot.link))
    }
}

impl LinkResolver for LinkTable {
    fn resolve(&self, handle: LinkHandle) -> Option<Arc<Link>> {
        self.get(handle)
    }
}

/// The process-wide router-core context, with explicit init/teardown.
pub struct Core {
    pub config: CoreConfig,
    pub stats: CoreStats,
    pub addresses: parking_lot::Mutex<AddressTable>,
    pub links: parking_lot::Mutex<LinkTable>,
    pub deliver_handler: Arc<dyn DeliverHandler>,
    pub offer_handler: Arc<dyn OfferHandler>,
    pub edge_uplink: Option<Arc<dyn EdgeUplink>>,
    pub tenant_space: Option<String>,
    /// The outgoing link representing this process's edge uplink
    /// connection, if it has one and that link has been attached.
    pub edge_uplink_link: parking_lot::Mutex<Option<LinkHandle>>,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        deliver_handler: Arc<dyn DeliverHandler>,
        offer_handler: Arc<dyn OfferHandler>,
        edge_uplink: Option<Arc<dyn EdgeUplink>>,
        tenant_space: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: CoreStats::default(),
            addresses: parking_lot::Mutex::new(AddressTable::new()),
            links: parking_lot::Mutex::new(LinkTable::new()),
            deliver_handler,
            offer_handler,
            edge_uplink,
            tenant_space,
            edge_uplink_link: parking_lot::Mutex::new(None),
        })
    }

    /// `true` if this process is acting as an edge router: presence of an
    /// edge uplink address is the signal.
    pub fn is_edge_router(&self) -> bool {
        self.edge_uplink
            .as_ref()
            .map(|e| e.edge_conn_addr().is_some())
            .unwrap_or(false)
    }

    /// Look up an address by its bare key, ignoring tenant-space
    /// annotation.
    pub fn resolve_address(&self, key: &str) -> Option<Arc<Address>> {
        self.addresses.lock().resolve(key, None)
    }

    /// Resolve a `to_addr` as it arrived on an incoming delivery: honors
    /// `tenant_space_enabled` before trying the tenant-prefixed key.
    pub fn resolve_to_addr(&self, to_addr: &str) -> Option<Arc<Address>> {
        let tenant_space = self.config.tenant_space_enabled.then(|| self.tenant_space.as_deref()).flatten();
        self.addresses.lock().resolve(to_addr, tenant_space)
    }

    pub fn link_resolver(&self) -> LinkResolverHandle<'_> {
        LinkResolverHandle { core: self }
    }

    /// Process one action to completion. `discard` actions release their
    /// payload without touching any other state.
    #[instrument(skip(self, kind))]
    pub fn process_action(&self, kind: ActionKind, discard: bool) {
        if discard {
            trace!("discarding action during shutdown");
            return;
        }
        match kind {
            ActionKind::LinkDeliver { link, delivery, more, .. } => {
                let Some(link) = self.links.lock().get(link) else {
                    warn!("link_deliver action for a link no longer in the table");
                    return;
                };
                link_deliver_ct(self, &link, &delivery, more);
            }
            ActionKind::LinkFlow { link, credit, drain } => {
                let Some(link) = self.links.lock().get(link) else {
                    warn!("link_flow action for a link no longer in the table");
                    return;
                };
                let resolver = self.link_resolver();
                link_flow_ct(&link, &link.connection, credit, drain, &resolver);
            }
        }
    }
}

/// Borrows [`Core::links`] behind the [`forwarder::LinkResolver`] trait so
/// the forwarder doesn't need to know about [`Core`] directly.
pub struct LinkResolverHandle<'a> {
    core: &'a Core,
}

impl LinkResolver for LinkResolverHandle<'_> {
    fn resolve(&self, handle: LinkHandle) -> Option<Arc<Link>> {
        self.core.links.lock().get(handle)
    }
}

/// A handle to a running core thread: the sending half of its action
/// channel plus the shared [`Core`] state for synchronous reads (stats,
/// address lookups for diagnostics).
pub struct CoreHandle {
    pub core: Arc<Core>,
    pub actions: ActionSender,
}

/// Spawn the core thread, which blocks on the action channel until every
/// sender (including the one returned here) is dropped.
pub fn spawn(core: Arc<Core>) -> (CoreHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = crate::action::channel(core.config.action_queue_capacity);
    let core_for_thread = Arc::clone(&core);
    let join = std::thread::Builder::new()
        .name("router-core".into())
        .spawn(move || run(core_for_thread, rx))
        .expect("failed to spawn core thread");
    (
        CoreHandle {
            core,
            actions: tx,
        },
        join,
    )
}

fn run(core: Arc<Core>, actions: ActionReceiver) {
    while let Some(action) = actions.recv() {
        core.process_action(action.kind, action.discard);
    }
    trace!("core thread exiting: action channel closed");
}
