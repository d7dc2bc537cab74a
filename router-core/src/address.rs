//! Address resolver subset (component C8): hash-keyed lookup, path-count,
//! fallback, tenant-space annotation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::instrument;

use crate::forwarder::link_forward_ct;
use crate::link::{Link, LinkHandle};

/// Per-address forwarding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Treatment {
    Anycast,
    Multicast,
    Closest,
    Balanced,
    Exchange,
    Unavailable,
}

/// Running counters kept per address, mirrored into the core-wide totals
/// on update.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressCounters {
    pub deliveries_ingress: u64,
    pub deliveries_redirected: u64,
    pub dropped_presettled_deliveries: u64,
}

/// An address entry. Holds exactly the fields this crate's forwarding
/// decisions need; a full router's address table carries far more.
pub struct Address {
    pub key: String,
    pub treatment: Treatment,
    /// Local subscriber links (e.g. in-process consumers); not otherwise
    /// modeled by this crate beyond their count.
    pub subscriptions: Mutex<HashSet<LinkHandle>>,
    /// Local outgoing links reachable for this address.
    pub rlinks: Mutex<HashSet<LinkHandle>>,
    /// Bitmask of remote routers advertising a path to this address.
    pub rnodes: Mutex<u64>,
    /// Number of exchange bindings, if this address is bound to an
    /// exchange (this crate treats exchange routing as opaque path count
    /// contribution; binding evaluation itself is out of scope).
    pub exchange_bindings: Mutex<usize>,
    /// Alternate/fallback address key for this address, if any.
    pub fallback: Mutex<Option<String>>,
    /// Addresses that use this one as their fallback, for
    /// `addr_start_inlinks` recursion.
    pub fallback_for: Mutex<Vec<String>>,
    /// Incoming links with deliveries parked because this address had no
    /// paths.
    pub inlinks: Mutex<Vec<LinkHandle>>,
    /// `true` if only CONTROL-typed links may target this address.
    pub router_control_only: bool,
    pub counters: Mutex<AddressCounters>,
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("key", &self.key)
            .field("treatment", &self.treatment)
            .field("path_count", &self.path_count())
            .finish()
    }
}

impl Address {
    pub fn new(key: impl Into<String>, treatment: Treatment) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            treatment,
            subscriptions: Mutex::new(HashSet::new()),
            rlinks: Mutex::new(HashSet::new()),
            rnodes: Mutex::new(0),
            exchange_bindings: Mutex::new(0),
            fallback: Mutex::new(None),
            fallback_for: Mutex::new(Vec::new()),
            inlinks: Mutex::new(Vec::new()),
            router_control_only: false,
            counters: Mutex::new(AddressCounters::default()),
        })
    }

    /// `path_count = |subscriptions| + |rlinks| + popcount(rnodes) +
    /// exchange-bindings + (alternate? 1 : 0)`. Computed on demand rather
    /// than tracked as a running counter, so it can never drift from its
    /// components.
    pub fn path_count(&self) -> usize {
        self.subscriptions.lock().len()
            + self.rlinks.lock().len()
            + self.rnodes.lock().count_ones() as usize
            + *self.exchange_bindings.lock()
            + if self.fallback.lock().is_some() { 1 } else { 0 }
    }

    /// Splice an ephemeral rlink into this address for the duration of one
    /// forwarding call (ingress path step 4's edge-uplink splice).
    pub fn splice_ephemeral_rlink(self: &Arc<Self>, link: LinkHandle) -> EphemeralRlink {
        self.rlinks.lock().insert(link);
        EphemeralRlink {
            addr: Arc::clone(self),
            link,
        }
    }

    /// Register a permanent local outgoing link as reachable for this
    /// address, waking any inbound link parked on it if this is the first
    /// path. The attach/subscribe machinery that decides when a link
    /// becomes a destination lives outside this crate; this is the entry
    /// point it calls once it has.
    pub fn add_rlink(self: &Arc<Self>, core: &crate::core::Core, link: LinkHandle) {
        let was_unreachable = self.path_count() == 0;
        self.rlinks.lock().insert(link);
        if was_unreachable {
            addr_start_inlinks(core, self);
        }
    }

    pub fn remove_rlink(&self, link: &LinkHandle) {
        self.rlinks.lock().remove(link);
    }

    /// Register a local subscriber link, waking parked inbound links if
    /// this is the first path.
    pub fn add_subscription(self: &Arc<Self>, core: &crate::core::Core, link: LinkHandle) {
        let was_unreachable = self.path_count() == 0;
        self.subscriptions.lock().insert(link);
        if was_unreachable {
            addr_start_inlinks(core, self);
        }
    }

    pub fn remove_subscription(&self, link: &LinkHandle) {
        self.subscriptions.lock().remove(link);
    }

    /// Mark router `bit` as advertising a path to this address, waking
    /// parked inbound links if this is the first path.
    pub fn set_rnode(self: &Arc<Self>, core: &crate::core::Core, bit: u64) {
        let was_unreachable = self.path_count() == 0;
        *self.rnodes.lock() |= 1 << bit;
        if was_unreachable {
            addr_start_inlinks(core, self);
        }
    }

    pub fn clear_rnode(&self, bit: u64) {
        *self.rnodes.lock() &= !(1 << bit);
    }

    /// Set this address's fallback key, waking parked inbound links if the
    /// address had no other paths (the fallback just made it reachable).
    /// Also registers this address on the fallback target's `fallback_for`
    /// list, if that target is already known, so a later path arriving on
    /// the target recurses back here.
    pub fn set_fallback(self: &Arc<Self>, core: &crate::core::Core, fallback_key: String) {
        let was_unreachable = self.path_count() == 0;
        if let Some(target) = core.resolve_address(&fallback_key) {
            target.fallback_for.lock().push(self.key.clone());
        }
        *self.fallback.lock() = Some(fallback_key);
        if was_unreachable {
            addr_start_inlinks(core, self);
        }
    }

    pub fn record_ingress(&self) {
        self.counters.lock().deliveries_ingress += 1;
    }

    pub fn record_redirect(&self) {
        self.counters.lock().deliveries_redirected += 1;
    }

    pub fn record_dropped_presettled(&self) {
        self.counters.lock().dropped_presettled_deliveries += 1;
    }
}

/// RAII guard that removes an ephemeral rlink spliced by
/// [`Address::splice_ephemeral_rlink`] when forwarding is done (ingress
/// path step 7).
pub struct EphemeralRlink {
    addr: Arc<Address>,
    link: LinkHandle,
}

impl Drop for EphemeralRlink {
    fn drop(&mut self) {
        self.addr.rlinks.lock().remove(&self.link);
    }
}

/// The core thread's address table: a hash-keyed map from address key to
/// [`Address`], exclusively owned by the core thread.
#[derive(Debug, Default)]
pub struct AddressTable {
    by_key: HashMap<String, Arc<Address>>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Address>> {
        self.by_key.get(key).cloned()
    }

    pub fn insert(&mut self, addr: Arc<Address>) {
        self.by_key.insert(addr.key.clone(), addr);
    }

    /// Tenant-space-annotated lookup: if `tenant_space` is set, try the
    /// tenant-prefixed key first, falling back to the bare key.
    pub fn resolve(&self, to_addr: &str, tenant_space: Option<&str>) -> Option<Arc<Address>> {
        if let Some(space) = tenant_space {
            let prefixed = format!("{space}{to_addr}");
            if let Some(addr) = self.by_key.get(&prefixed) {
                return Some(Arc::clone(addr));
            }
        }
        self.by_key.get(to_addr).cloned()
    }
}

/// Reconsider deliveries parked on an incoming link's `undelivered` list
/// because the address they targeted had no paths at the time. The list
/// is moved out first so that a delivery re-parked by `link_forward_ct`
/// (still no path) doesn't retrigger this same loop.
#[instrument(skip(core, link))]
pub fn drain_inbound_undelivered(core: &crate::core::Core, link: &Arc<Link>) {
    let parked = link.lock_mutable().queues.take_undelivered();
    for delivery in parked {
        let address = if let Some(owning) = link.owning_addr() {
            core.resolve_address(&owning)
        } else {
            delivery.to_addr.as_deref().and_then(|a| core.resolve_to_addr(a))
        };
        let more = !delivery.send_complete();
        link_forward_ct(core, link, &delivery, address, more);
    }
}

/// Called after a destination is added to `addr`. If this addition just
/// brought `path_count` to 1 (first reachable path) or made `fallback`
/// viable for the first time, wake every incoming link parked on this
/// address: grant stored credit, then drain undelivered. Also recurses
/// into addresses that use `addr` as their own fallback.
#[instrument(skip(core, addr))]
pub fn addr_start_inlinks(core: &crate::core::Core, addr: &Arc<Address>) {
    let inlinks = std::mem::take(&mut *addr.inlinks.lock());
    for handle in inlinks {
        let Some(link) = core.links.lock().get(handle) else {
            continue;
        };
        let credit_pending = {
            let mut mutable = link.lock_mutable();
            std::mem::take(&mut mutable.flow.credit_pending)
        };
        if credit_pending > 0 {
            if let Some(item) = crate::flow::issue_credit_ct(&link, credit_pending, None) {
                tracing::trace!(?item, "granted stored credit on path availability");
            }
        }
        drain_inbound_undelivered(core, &link);
    }

    let fallback_for: Vec<String> = addr.fallback_for.lock().clone();
    for key in fallback_for {
        if let Some(dependent) = core.resolve_address(&key) {
            addr_start_inlinks(core, &dependent);
        }
    }
}
