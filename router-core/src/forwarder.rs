//! Forwarder (component C4): given a link, a delivery, and a resolved
//! address, decides the target set and enqueues copies on outgoing links.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use tracing::{instrument, trace};

use crate::address::Address;
use crate::connection::ConnectionRole;
use crate::core::Core;
use crate::delivery::{disposition, Delivery, Where};
use crate::error::DeliveryError;
use crate::flow::issue_credit_ct;
use crate::link::{Link, LinkHandle, LinkType};

/// Looks up a link by its weak handle. Implemented by
/// [`crate::core::LinkTable`]; kept as a trait so this module doesn't
/// depend on `core` for anything but [`Core`] itself.
pub trait LinkResolver: Send + Sync {
    fn resolve(&self, handle: LinkHandle) -> Option<Arc<Link>>;
}

/// Treatment-driven fanout: pick the destination link set for `addr` and
/// enqueue an independent copy of `delivery` on each one's `undelivered`
/// list. Returns the number of copies enqueued.
///
/// Anycast/closest/balanced/exchange all pick a single rlink here; a full
/// router's load-balancing and proximity logic is out of scope for this
/// crate (see DESIGN.md).
#[instrument(skip(addr, delivery, resolver))]
pub fn forward_message(
    addr: &Arc<Address>,
    delivery: &Arc<Delivery>,
    resolver: &dyn LinkResolver,
    _exclude_inprocess: bool,
    _control: bool,
) -> usize {
    use crate::address::Treatment;

    let targets: Vec<LinkHandle> = match addr.treatment {
        Treatment::Unavailable => Vec::new(),
        Treatment::Multicast => addr.rlinks.lock().iter().copied().collect(),
        Treatment::Anycast | Treatment::Closest | Treatment::Balanced | Treatment::Exchange => {
            addr.rlinks.lock().iter().next().copied().into_iter().collect()
        }
    };

    let mut fanout = 0;
    for handle in targets {
        if is_excluded(delivery, handle) {
            continue;
        }
        let Some(dest) = resolver.resolve(handle) else {
            continue;
        };
        let peer = delivery.copy_for_peer(handle);
        delivery.add_peer(Arc::clone(&peer));
        dest.lock_mutable().queues.push_undelivered(peer);
        dest.connection.add_link_work(handle, 1);
        dest.connection.activate();
        fanout += 1;
    }
    trace!(fanout, addr = %addr.key, "forwarded");
    fanout
}

fn is_excluded(delivery: &Delivery, handle: LinkHandle) -> bool {
    delivery
        .link_exclusion
        .map(|mask| mask & (1 << (handle.key % 64)) != 0)
        .unwrap_or(false)
}

fn fallback_path_count(core: &Core, addr: &Address) -> usize {
    addr.fallback
        .lock()
        .clone()
        .and_then(|key| core.resolve_address(&key))
        .map(|fb| fb.path_count())
        .unwrap_or(0)
}

/// Release a delivery back upstream (`delivery_release_CT`): marks it
/// RELEASED. A streaming, presettled message additionally asks
/// the receiver to restart so the body bytes already sent aren't wasted
/// -- modeled as leaving `send_complete() == false`, which the transport
/// layer is expected to interpret as "request restart" when paired with a
/// RELEASED disposition.
fn release(delivery: &Arc<Delivery>) {
    delivery.set_disposition(disposition::RELEASED);
}

/// A targeted sender whose own address has no paths (and no usable
/// fallback) gets its delivery released rather than parked forever.
fn handle_no_path(core: &Core, link: &Arc<Link>, delivery: &Arc<Delivery>) {
    release(delivery);
    if delivery.presettled {
        link.lock_mutable().flow.dropped_presettled_deliveries += 1;
        core.stats.dropped_presettled_deliveries.fetch_add(1, Relaxed);
    }

    let on_edge_connection = link.connection.role == ConnectionRole::EdgeUplink;
    if !on_edge_connection {
        issue_credit_ct(link, 0, Some(true));
    }

    if link.edge || delivery.is_multicast() {
        issue_credit_ct(link, 1, None);
    } else {
        link.lock_mutable().flow.credit_pending += 1;
    }
    delivery.set_where(Where::Nowhere);
}

/// No address at all, and the configured default treatment for unresolved
/// addresses is UNAVAILABLE.
fn reject_unavailable(delivery: &Arc<Delivery>) {
    delivery.set_disposition(disposition::REJECTED);
    delivery.set_error(DeliveryError::unavailable());
    delivery.set_where(Where::Nowhere);
}

/// The original delivery's own bookkeeping once fanout (if any) has been
/// produced.
fn finalize(link: &Arc<Link>, delivery: &Arc<Delivery>, fanout: usize, more: bool) -> usize {
    if fanout == 0 {
        if !delivery.is_settled() {
            release(delivery);
        }
        issue_credit_ct(link, 1, None);
        delivery.set_where(Where::Nowhere);
    } else if delivery.is_settled() || delivery.is_multicast() {
        issue_credit_ct(link, 1, None);
        if more {
            link.lock_mutable().queues.push_settled(Arc::clone(delivery));
        } else {
            delivery.set_where(Where::Nowhere);
        }
    } else {
        link.lock_mutable().queues.push_unsettled(Arc::clone(delivery));
        if matches!(link.link_type, LinkType::Router) || link.edge {
            issue_credit_ct(link, 1, None);
        }
    }
    fanout
}

/// The forwarding decision tree, evaluated in order against an
/// already-resolved (possibly absent) address.
#[instrument(skip(core, link, delivery, address))]
pub fn link_forward_ct(
    core: &Core,
    link: &Arc<Link>,
    delivery: &Arc<Delivery>,
    address: Option<Arc<Address>>,
    more: bool,
) -> usize {
    let resolver = core.link_resolver();

    // Targeted sender, no reachable path and no usable fallback.
    if let Some(addr) = &address {
        let targeted = link.owning_addr().as_deref() == Some(addr.key.as_str());
        if targeted && addr.path_count() == 0 {
            let fallback_empty = fallback_path_count(core, addr) == 0;
            if link.fallback || fallback_empty {
                handle_no_path(core, link, delivery);
                return 0;
            }
        }
    }

    // No address at all, default policy says reject outright.
    if address.is_none() && core.config.default_treatment == crate::address::Treatment::Unavailable {
        reject_unavailable(delivery);
        return 0;
    }

    // Ordinary forward.
    let fanout = match &address {
        Some(addr) => {
            delivery.set_multicast(addr.treatment == crate::address::Treatment::Multicast);
            let control = link.link_type == LinkType::Control;
            let n = forward_message(addr, delivery, &resolver, false, control);
            let counts_toward_ingress =
                !matches!(link.link_type, LinkType::Control | LinkType::Router) && !link.fallback;
            if counts_toward_ingress {
                addr.record_ingress();
                core.stats.deliveries_ingress.fetch_add(1, Relaxed);
            }
            n
        }
        None => 0,
    };

    // Anonymous miss: re-attempt via the edge uplink.
    if fanout == 0
        && !delivery.is_multicast()
        && link.owning_addr().is_none()
        && delivery.to_addr.is_some()
        && core.is_edge_router()
        && link.connection.role != ConnectionRole::EdgeUplink
    {
        if let Some(edge_addr) = core.edge_uplink.as_ref().and_then(|e| e.edge_conn_addr()) {
            if let Some(edge_address) = core.resolve_address(&edge_addr.0) {
                let n = forward_message(&edge_address, delivery, &resolver, false, false);
                if n > 0 {
                    return finalize(link, delivery, n, more);
                }
            }
        }
    }

    // Fallback redirect.
    if fanout == 0 && !link.fallback {
        if let Some(addr) = &address {
            let fallback_key = addr.fallback.lock().clone();
            if let Some(fallback_key) = fallback_key {
                if let Some(fallback_addr) = core.resolve_address(&fallback_key) {
                    let stripped = fallback_key.get(2..).unwrap_or(&fallback_key).to_string();
                    let phase = fallback_key
                        .as_bytes()
                        .get(1)
                        .map(|b| (*b as i32) - ('0' as i32))
                        .unwrap_or(0);
                    delivery.with_message_mut(|m| {
                        m.set_to_override_annotation(Some(stripped));
                        m.set_phase_annotation(phase);
                    });
                    let n = forward_message(&fallback_addr, delivery, &resolver, false, false);
                    fallback_addr.record_redirect();
                    core.stats.deliveries_redirected.fetch_add(1, Relaxed);
                    return finalize(link, delivery, n, more);
                }
            }
        }
    }

    finalize(link, delivery, fanout, more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Treatment};
    use crate::config::CoreConfig;
    use crate::connection::{Connection, ConnectionId, ConnectionRole};
    use crate::core::{Core, LinkTable};
    use crate::delivery::DeliveryTag;
    use crate::error::Condition;
    use crate::link::{Direction, LinkType};
    use crate::message::TestMessage;
    use crate::transport::RecordingTransport;

    fn test_core() -> Arc<Core> {
        let transport = Arc::new(RecordingTransport::new());
        Core::new(CoreConfig::default(), transport.clone(), transport, None, None)
    }

    fn test_connection() -> Arc<Connection> {
        Connection::new(ConnectionId(0), ConnectionRole::Normal, None, || {})
    }

    fn test_delivery(to_addr: Option<&str>, presettled: bool) -> Arc<Delivery> {
        Delivery::new(
            Box::new(TestMessage::complete()),
            None,
            to_addr.map(String::from),
            presettled,
            false,
            0,
            0,
            DeliveryTag::new(b"t").unwrap(),
            LinkHandle::dangling(),
        )
    }

    #[test]
    fn anycast_hit_forwards_to_single_rlink() {
        let core = test_core();
        let mut links = LinkTable::new();
        let outgoing = Link::new(
            Direction::Outgoing,
            LinkType::Endpoint,
            "out",
            false,
            false,
            test_connection(),
            10,
        );
        let out_handle = links.insert(outgoing);
        let addr = Address::new("foo", Treatment::Anycast);
        addr.rlinks.lock().insert(out_handle);
        core.addresses.lock().insert(Arc::clone(&addr));
        *core.links.lock() = links;

        let incoming = Link::new(
            Direction::Incoming,
            LinkType::Endpoint,
            "in",
            false,
            false,
            test_connection(),
            0,
        );
        let in_handle = core.links.lock().insert(incoming);
        let in_link = core.links.lock().get(in_handle).unwrap();

        let delivery = test_delivery(Some("foo"), false);
        let fanout = link_forward_ct(&core, &in_link, &delivery, Some(addr), false);
        assert_eq!(fanout, 1);
        let out_link = core.links.lock().get(out_handle).unwrap();
        assert_eq!(out_link.lock_mutable().queues.undelivered.len(), 1);
    }

    #[test]
    fn unavailable_with_no_address_rejects() {
        let mut config = CoreConfig::default();
        config.default_treatment = crate::address::Treatment::Unavailable;
        let transport = Arc::new(RecordingTransport::new());
        let core = Core::new(config, transport.clone(), transport, None, None);
        let incoming = Link::new(
            Direction::Incoming,
            LinkType::Endpoint,
            "in",
            false,
            false,
            test_connection(),
            0,
        );
        let handle = core.links.lock().insert(incoming);
        let link = core.links.lock().get(handle).unwrap();

        let delivery = test_delivery(Some("missing"), false);
        let fanout = link_forward_ct(&core, &link, &delivery, None, false);
        assert_eq!(fanout, 0);
        assert_eq!(delivery.disposition(), disposition::REJECTED);
        assert_eq!(delivery.error().unwrap().condition, Condition::NotFound);
    }
}
