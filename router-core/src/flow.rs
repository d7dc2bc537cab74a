//! Credit/Flow machine (component C3): per-link credit, drain mode,
//! stalled-outbound tracking, incremental credit accounting.

use tracing::{debug, instrument, trace};

use crate::connection::Connection;
use crate::forwarder::LinkResolver;
use crate::link::queue::{DrainAction, WorkItem};
use crate::link::{Link, RouteKind};

/// The scalar flow-control fields of a link, guarded together with that
/// link's queues (see [`crate::link::LinkMutable`]).
#[derive(Debug, Default)]
pub struct LinkFlowCounters {
    /// Receiver-configured credit window, used when re-granting credit
    /// after a drop (`credit_pending = capacity`).
    pub capacity: u32,
    /// Credit granted to the core since the last drain-mode exit.
    pub credit_to_core: u32,
    /// Credit owed but not yet granted, because the address had no paths.
    pub credit_pending: u32,
    /// Credit accumulated while the link is only half-open
    /// (`attach_count == 1`).
    pub credit_stored: u32,
    /// Current drain-mode bit.
    pub drain_mode: bool,
    /// Total deliveries fully transmitted (outgoing links only).
    pub total_deliveries: u64,
    /// Presettled deliveries dropped for lack of any reachable path.
    pub dropped_presettled_deliveries: u64,
}

/// Convert an absolute credit value from the transport into an incremental
/// delta: the caller-side `link_flow` converts absolute to incremental by
/// subtracting `credit_to_core` (clamped to ≥0) and adding the delta back
/// to `credit_to_core`. Leaving drain mode resets `credit_to_core` to 0
/// first.
pub fn absolute_to_incremental(flow: &mut LinkFlowCounters, absolute: u32, leaving_drain: bool) -> u32 {
    if leaving_drain {
        flow.credit_to_core = 0;
    }
    let delta = absolute.saturating_sub(flow.credit_to_core);
    flow.credit_to_core = flow.credit_to_core.saturating_add(delta);
    delta
}

/// Outcome of [`link_flow_ct`], reported for observability and testing
/// rather than as an error channel: these are expected decision-tree
/// branches, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOutcome {
    /// Whether the connection's I/O thread should be woken up.
    pub activate: bool,
}

/// Core-thread processing of an incoming FLOW.
///
/// `credit` is already the incremental delta (the caller converted it via
/// [`absolute_to_incremental`] before enqueueing the action).
#[instrument(skip(link, connection, resolver), fields(link = ?link.handle))]
pub fn link_flow_ct(
    link: &Link,
    connection: &Connection,
    credit: u32,
    drain: bool,
    resolver: &dyn LinkResolver,
) -> FlowOutcome {
    let mut activate = false;

    let route = link.route_kind();
    let mut mutable = link.mutable.lock();

    let drain_changed = mutable.flow.drain_mode != drain;
    mutable.flow.drain_mode = drain;

    if mutable.stalled_outbound && !mutable.queues.undelivered.is_empty() {
        mutable.stalled_outbound = false;
        drop(mutable);
        connection.add_link_work(link.handle, 0);
        activate = true;
        mutable = link.mutable.lock();
    }

    match route {
        RouteKind::CoreEndpoint => {
            trace!("flow delegated to core endpoint handler");
        }
        RouteKind::AttachRouted(peer_handle) => {
            if let Some(peer) = resolver.resolve(peer_handle) {
                match peer.direction {
                    crate::link::Direction::Incoming => {
                        if issue_credit_ct(&peer, credit, None).is_some() {
                            peer.connection.add_link_work(peer_handle, 0);
                            peer.connection.activate();
                        }
                    }
                    crate::link::Direction::Outgoing => {
                        if drain {
                            peer.lock_mutable()
                                .queues
                                .work_list
                                .push_back(WorkItem::Flow { drain_action: DrainAction::Set });
                            peer.connection.add_link_work(peer_handle, 0);
                            peer.connection.activate();
                        }
                    }
                }
            } else {
                debug!("attach-routed peer no longer live; dropping flow propagation");
            }
        }
        RouteKind::AddressRouted(_addr) => {
            if mutable.attach_count == 1 {
                mutable.flow.credit_stored = mutable.flow.credit_stored.saturating_add(credit);
            }

            match link.direction {
                crate::link::Direction::Outgoing => {
                    if credit > 0 || drain_changed {
                        if drain_changed {
                            let drain_action = if drain { DrainAction::Set } else { DrainAction::Clear };
                            mutable.queues.work_list.push_back(WorkItem::Flow { drain_action });
                        }
                        let has_undelivered = !mutable.queues.undelivered.is_empty();
                        if has_undelivered || drain_changed {
                            drop(mutable);
                            connection.add_link_work(link.handle, 0);
                            activate = true;
                            mutable = link.mutable.lock();
                        }
                    }
                }
                crate::link::Direction::Incoming => {
                    if drain {
                        mutable.flow.credit_pending = mutable.flow.capacity;
                    }
                }
            }
        }
    }

    drop(mutable);
    if activate {
        connection.activate();
    }

    FlowOutcome { activate }
}

/// Grant credit to an incoming endpoint link (`issue_credit_CT`):
/// `credit_pending` is reduced by `credit` (saturating at 0); a drain-mode
/// change flips `drain_mode`; if nothing changed, no work unit is
/// produced.
#[instrument(skip(link), fields(link = ?link.handle))]
pub fn issue_credit_ct(link: &Link, credit: u32, drain: Option<bool>) -> Option<WorkItem> {
    let mut mutable = link.mutable.lock();

    let mut changed = false;
    let drain_action = match drain {
        Some(new_drain) if new_drain != mutable.flow.drain_mode => {
            mutable.flow.drain_mode = new_drain;
            changed = true;
            if new_drain { DrainAction::Set } else { DrainAction::Clear }
        }
        _ => DrainAction::None,
    };

    if credit > 0 {
        let before = mutable.flow.credit_pending;
        mutable.flow.credit_pending = before.saturating_sub(credit);
        if mutable.flow.credit_pending != before {
            changed = true;
        }
    }

    if !changed {
        return None;
    }

    let item = WorkItem::Flow { drain_action };
    mutable.queues.work_list.push_back(item.clone());
    Some(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_to_incremental_round_trips_without_drain_transition() {
        let mut flow = LinkFlowCounters::default();
        let delta1 = absolute_to_incremental(&mut flow, 10, false);
        assert_eq!(delta1, 10);
        assert_eq!(flow.credit_to_core, 10);

        let delta2 = absolute_to_incremental(&mut flow, 15, false);
        assert_eq!(delta2, 5);
        assert_eq!(flow.credit_to_core, 15);
    }

    #[test]
    fn leaving_drain_resets_credit_to_core_first() {
        let mut flow = LinkFlowCounters::default();
        flow.credit_to_core = 7;
        flow.drain_mode = true;
        let delta = absolute_to_incremental(&mut flow, 10, true);
        assert_eq!(delta, 10);
        assert_eq!(flow.credit_to_core, 10);
    }

    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::connection::{ConnectionId, ConnectionRole};
    use crate::link::{Direction, LinkHandle, LinkType};

    struct MapResolver(HashMap<LinkHandle, Arc<Link>>);

    impl LinkResolver for MapResolver {
        fn resolve(&self, handle: LinkHandle) -> Option<Arc<Link>> {
            self.0.get(&handle).cloned()
        }
    }

    fn test_connection() -> Arc<Connection> {
        Connection::new(ConnectionId(0), ConnectionRole::Normal, None, || {})
    }

    #[test]
    fn attach_routed_flow_issues_credit_to_incoming_peer() {
        let peer = Arc::new(Link::new(
            Direction::Incoming,
            LinkType::Endpoint,
            "peer",
            false,
            false,
            test_connection(),
            0,
        ));
        peer.lock_mutable().flow.credit_pending = 8;
        let peer_handle = LinkHandle::new(1, 0);
        let resolver = MapResolver(HashMap::from([(peer_handle, Arc::clone(&peer))]));

        let link = Link::new(
            Direction::Outgoing,
            LinkType::Endpoint,
            "local",
            false,
            false,
            test_connection(),
            0,
        );
        link.bind_connected_link(peer_handle);

        link_flow_ct(&link, &link.connection.clone(), 5, false, &resolver);

        assert_eq!(peer.lock_mutable().flow.credit_pending, 3);
        assert_eq!(peer.connection.activate_count(), 1);
    }

    #[test]
    fn attach_routed_drain_enqueues_flow_on_outgoing_peer() {
        let peer = Arc::new(Link::new(
            Direction::Outgoing,
            LinkType::Endpoint,
            "peer",
            false,
            false,
            test_connection(),
            0,
        ));
        let peer_handle = LinkHandle::new(1, 0);
        let resolver = MapResolver(HashMap::from([(peer_handle, Arc::clone(&peer))]));

        let link = Link::new(
            Direction::Incoming,
            LinkType::Endpoint,
            "local",
            false,
            false,
            test_connection(),
            0,
        );
        link.bind_connected_link(peer_handle);

        link_flow_ct(&link, &link.connection.clone(), 0, true, &resolver);

        assert!(matches!(
            peer.lock_mutable().queues.work_list.back(),
            Some(WorkItem::Flow { drain_action: DrainAction::Set })
        ));
        assert_eq!(peer.connection.activate_count(), 1);
    }
}
