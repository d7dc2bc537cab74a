//! Ingress state machine (component C5, `link_deliver_CT`): handles a
//! delivery arriving on an incoming link.

use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::connection::ConnectionRole;
use crate::core::Core;
use crate::delivery::Delivery;
use crate::flow::issue_credit_ct;
use crate::forwarder::link_forward_ct;
use crate::link::{Link, LinkType, RouteKind};

/// Process one delivery arriving on an incoming link.
#[instrument(skip(core, link, delivery))]
pub fn link_deliver_ct(core: &Core, link: &Arc<Link>, delivery: &Arc<Delivery>, more: bool) {
    // Step 1: stamp ingress bookkeeping.
    delivery.set_via_edge(link.edge);

    match link.route_kind() {
        // Step 2: bound to a core-internal endpoint -- handed off whole,
        // no list work happens here.
        RouteKind::CoreEndpoint => {
            trace!("delivered to core endpoint handler");
        }

        // Step 3: attach-routed straight through to a paired peer link.
        RouteKind::AttachRouted(peer_handle) => {
            core.stats.deliveries_ingress_route_container.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

            let Some(peer) = core.links.lock().get(peer_handle) else {
                debug!("attach-routed peer no longer live; dropping delivery");
                return;
            };
            let peer_delivery = delivery.copy_for_peer(peer_handle);
            delivery.add_peer(Arc::clone(&peer_delivery));
            peer.lock_mutable().queues.push_undelivered(Arc::clone(&peer_delivery));
            peer.connection.add_link_work(peer_handle, 1);
            peer.connection.activate();

            if !delivery.is_settled() {
                link.lock_mutable().queues.push_unsettled(Arc::clone(delivery));
            }
        }

        // Steps 4-7: address-based forwarding.
        RouteKind::AddressRouted(_) => address_routed(core, link, delivery, more),
    }
}

fn address_routed(core: &Core, link: &Arc<Link>, delivery: &Arc<Delivery>, more: bool) {
    // Step 4 invariant: a link only reaches address resolution with an
    // empty `undelivered` -- address-routed links never park a delivery
    // there themselves; forwarding either enqueues it on a *different*
    // link's `undelivered` or disposes of it immediately. If this ever
    // fires it means a delivery was re-entrantly queued while a prior one
    // for this link was still being resolved -- a race, not dead code.
    let has_undelivered = !link.lock_mutable().queues.undelivered.is_empty();
    debug_assert!(
        !has_undelivered,
        "address-routed link reached forwarding with a non-empty undelivered list"
    );
    if has_undelivered {
        core.stats.undelivered_race_observed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        drain_undelivered_before_resolving(core, link);
    }

    let on_edge_connection = link.connection.role == ConnectionRole::EdgeUplink;
    let we_are_edge_router = core.is_edge_router();

    let mut ephemeral_guard = None;
    let address = if let Some(owning) = link.owning_addr() {
        core.resolve_address(&owning)
    } else if let Some(to_addr) = &delivery.to_addr {
        let resolved = core.resolve_to_addr(to_addr).or_else(|| {
            if we_are_edge_router && !on_edge_connection {
                core.edge_uplink
                    .as_ref()
                    .and_then(|e| e.edge_conn_addr())
                    .and_then(|edge_addr| core.resolve_address(&edge_addr.0))
            } else {
                None
            }
        });

        if let Some(addr) = &resolved {
            if addr.treatment == crate::address::Treatment::Multicast && we_are_edge_router && !on_edge_connection {
                if let Some(edge_link) = *core.edge_uplink_link.lock() {
                    ephemeral_guard = Some(addr.splice_ephemeral_rlink(edge_link));
                }
            }
        }
        resolved
    } else {
        None
    };

    // Step 5: router-control-only addresses reject non-control links.
    if let Some(addr) = &address {
        if addr.router_control_only && link.link_type != LinkType::Control {
            delivery.set_disposition(crate::delivery::disposition::RELEASED);
            issue_credit_ct(link, core.config.release_credit_refund, None);
            delivery.set_where(crate::delivery::Where::Nowhere);
            return;
        }
    }

    // Step 6: forward.
    link_forward_ct(core, link, delivery, address, more);

    // Step 7: ephemeral rlink splice (if any) is removed by `ephemeral_guard`'s drop.
    drop(ephemeral_guard);
}

/// Rather than asserting and proceeding anyway when the invariant is
/// violated, re-run the normal undelivered drain path before continuing,
/// so the violation is corrected instead of silently ignored.
fn drain_undelivered_before_resolving(core: &Core, link: &Arc<Link>) {
    crate::address::drain_inbound_undelivered(core, link);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Treatment};
    use crate::config::CoreConfig;
    use crate::connection::{Connection, ConnectionId};
    use crate::core::Core;
    use crate::delivery::DeliveryTag;
    use crate::link::Direction;
    use crate::message::TestMessage;
    use crate::transport::RecordingTransport;

    fn test_core() -> Arc<Core> {
        let transport = Arc::new(RecordingTransport::new());
        Core::new(CoreConfig::default(), transport.clone(), transport, None, None)
    }

    fn test_connection() -> Arc<Connection> {
        Connection::new(ConnectionId(0), ConnectionRole::Normal, None, || {})
    }

    #[test]
    fn anonymous_hit_enqueues_on_rlink_and_replenishes_credit() {
        let core = test_core();
        let out = Link::new(Direction::Outgoing, LinkType::Endpoint, "out", false, false, test_connection(), 10);
        let out_handle = core.links.lock().insert(out);
        let addr = Address::new("foo", Treatment::Anycast);
        addr.rlinks.lock().insert(out_handle);
        core.addresses.lock().insert(addr);

        let incoming = Link::new(Direction::Incoming, LinkType::Endpoint, "in", false, false, test_connection(), 0);
        let in_handle = core.links.lock().insert(incoming);
        let in_link = core.links.lock().get(in_handle).unwrap();

        let delivery = Delivery::new(
            Box::new(TestMessage::complete()),
            None,
            Some("foo".into()),
            false,
            false,
            0,
            0,
            DeliveryTag::new(b"t").unwrap(),
            in_handle,
        );
        link_deliver_ct(&core, &in_link, &delivery, false);

        let out_link = core.links.lock().get(out_handle).unwrap();
        assert_eq!(out_link.lock_mutable().queues.undelivered.len(), 1);
        assert_eq!(in_link.lock_mutable().flow.credit_pending, 0);
    }

    #[test]
    fn attach_routed_delivery_counts_toward_route_container_ingress() {
        let core = test_core();

        let peer = Link::new(Direction::Outgoing, LinkType::Endpoint, "peer", false, false, test_connection(), 10);
        let peer_handle = core.links.lock().insert(peer);

        let incoming = Link::new(Direction::Incoming, LinkType::Endpoint, "in", false, false, test_connection(), 0);
        let in_handle = core.links.lock().insert(incoming);
        let in_link = core.links.lock().get(in_handle).unwrap();
        in_link.bind_connected_link(peer_handle);

        let delivery = Delivery::new(
            Box::new(TestMessage::complete()),
            None,
            None,
            false,
            false,
            0,
            0,
            DeliveryTag::new(b"t").unwrap(),
            in_handle,
        );
        link_deliver_ct(&core, &in_link, &delivery, false);

        assert_eq!(core.stats.snapshot().deliveries_ingress_route_container, 1);
        assert_eq!(core.stats.snapshot().deliveries_ingress, 0);
    }
}
