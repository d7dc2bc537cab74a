//! End-to-end delivery scenarios exercised through the public API, one per
//! concrete scenario this crate's design is validated against.

use std::sync::Arc;

use router_core::address::{Address, Treatment};
use router_core::config::CoreConfig;
use router_core::connection::{Connection, ConnectionId, ConnectionRole};
use router_core::core::Core;
use router_core::delivery::{disposition, Delivery, DeliveryTag, Where};
use router_core::error::Condition;
use router_core::link::{Direction, Link, LinkType};
use router_core::message::TestMessage;
use router_core::transport::RecordingTransport;

fn test_core() -> Arc<Core> {
    let transport = Arc::new(RecordingTransport::new());
    Core::new(CoreConfig::default(), transport.clone(), transport, None, None)
}

fn test_connection() -> Arc<Connection> {
    Connection::new(ConnectionId(0), ConnectionRole::Normal, None, || {})
}

fn delivery(to_addr: Option<&str>, presettled: bool) -> Arc<Delivery> {
    Delivery::new(
        Box::new(TestMessage::complete()),
        None,
        to_addr.map(String::from),
        presettled,
        false,
        0,
        0,
        DeliveryTag::new(b"t").unwrap(),
        router_core::link::LinkHandle::dangling(),
    )
}

/// Scenario 1: an outgoing link with no owning address, one rlink on
/// address "foo". A delivery targeting "foo" enqueues on the rlink,
/// replenishes credit on the ingress link, and eventually lands in the
/// rlink's `unsettled` list once transmitted.
#[test]
fn anonymous_hit() {
    let core = test_core();

    let out = Link::new(Direction::Outgoing, LinkType::Endpoint, "out", false, false, test_connection(), 10);
    let out_handle = core.links.lock().insert(out);
    let addr = Address::new("foo", Treatment::Anycast);
    addr.rlinks.lock().insert(out_handle);
    core.addresses.lock().insert(addr);

    let incoming = Link::new(Direction::Incoming, LinkType::Endpoint, "in", false, false, test_connection(), 0);
    let in_handle = core.links.lock().insert(incoming);
    let in_link = core.links.lock().get(in_handle).unwrap();

    let dlv = delivery(Some("foo"), false);
    router_core::ingress::link_deliver_ct(&core, &in_link, &dlv, false);

    let out_link = core.links.lock().get(out_handle).unwrap();
    assert_eq!(out_link.lock_mutable().queues.undelivered.len(), 1);
    assert_eq!(in_link.lock_mutable().flow.credit_pending, 0);

    let transport = RecordingTransport::new();
    let token = out_link.connection.io_token();
    let n = router_core::egress::process_deliveries(&out_link, 5, &transport, &transport, &token);
    assert_eq!(n, 1);
    assert_eq!(out_link.lock_mutable().queues.unsettled.len(), 1);
}

/// Scenario 2: default treatment UNAVAILABLE, the address is unknown.
/// The delivery is rejected with `amqp:not-found` and nothing is forwarded.
#[test]
fn unavailable_rejects() {
    let mut config = CoreConfig::default();
    config.default_treatment = Treatment::Unavailable;
    let transport = Arc::new(RecordingTransport::new());
    let core = Core::new(config, transport.clone(), transport, None, None);

    let incoming = Link::new(Direction::Incoming, LinkType::Endpoint, "in", false, false, test_connection(), 0);
    let handle = core.links.lock().insert(incoming);
    let link = core.links.lock().get(handle).unwrap();

    let dlv = delivery(Some("missing"), false);
    router_core::ingress::link_deliver_ct(&core, &link, &dlv, false);

    assert_eq!(dlv.disposition(), disposition::REJECTED);
    assert_eq!(dlv.error().unwrap().condition, Condition::NotFound);
    assert_eq!(dlv.where_tag(), Where::Nowhere);
}

/// Scenario 3: address "q" has no paths, but `q`'s fallback address has one
/// rlink. The delivery is redirected: its `to` annotation is rewritten and
/// the redirect counters bump.
#[test]
fn fallback_redirect() {
    let core = test_core();

    let out = Link::new(Direction::Outgoing, LinkType::Endpoint, "out", false, false, test_connection(), 10);
    let out_handle = core.links.lock().insert(out);
    let fallback_addr = Address::new("01q.bak", Treatment::Anycast);
    fallback_addr.rlinks.lock().insert(out_handle);
    core.addresses.lock().insert(Arc::clone(&fallback_addr));

    let q = Address::new("q", Treatment::Anycast);
    *q.fallback.lock() = Some("01q.bak".into());
    core.addresses.lock().insert(Arc::clone(&q));

    let incoming = Link::new(Direction::Incoming, LinkType::Endpoint, "in", false, false, test_connection(), 0);
    let in_handle = core.links.lock().insert(incoming);
    let in_link = core.links.lock().get(in_handle).unwrap();

    let dlv = delivery(Some("q"), false);
    router_core::ingress::link_deliver_ct(&core, &in_link, &dlv, false);

    let out_link = core.links.lock().get(out_handle).unwrap();
    assert_eq!(out_link.lock_mutable().queues.undelivered.len(), 1);
    assert_eq!(core.stats.snapshot().deliveries_redirected, 1);
    assert_eq!(fallback_addr.counters.lock().deliveries_redirected, 1);
}

/// Scenario 4: two deliveries queued on an outgoing link with credit=5.
/// The first returns `send_complete=false` until a later pass; the second
/// must not be touched until the first completes, and `total_deliveries`
/// advances by exactly one per completion.
#[test]
fn streaming_head_of_line() {
    let connection = test_connection();
    let link = Arc::new(Link::new(Direction::Outgoing, LinkType::Endpoint, "out", false, false, connection, 10));

    let streaming = Delivery::new(
        Box::new(TestMessage::incomplete()),
        None,
        None,
        false,
        false,
        0,
        0,
        DeliveryTag::new(b"a").unwrap(),
        router_core::link::LinkHandle::dangling(),
    );
    let second = delivery(None, false);
    link.lock_mutable().queues.push_undelivered(Arc::clone(&streaming));
    link.lock_mutable().queues.push_undelivered(second);

    let transport = RecordingTransport::new();
    let token = link.connection.io_token();

    let n = router_core::egress::process_deliveries(&link, 5, &transport, &transport, &token);
    assert_eq!(n, 0);
    assert_eq!(link.lock_mutable().queues.undelivered.len(), 2);
    assert_eq!(link.lock_mutable().flow.total_deliveries, 0);

    let completed_head = Delivery::new(
        Box::new(TestMessage::complete()),
        None,
        None,
        false,
        false,
        0,
        0,
        DeliveryTag::new(b"a").unwrap(),
        router_core::link::LinkHandle::dangling(),
    );
    {
        let mut mutable = link.lock_mutable();
        mutable.queues.pop_undelivered();
        mutable.queues.undelivered.push_front(completed_head);
    }
    let n = router_core::egress::process_deliveries(&link, 5, &transport, &transport, &token);
    assert_eq!(n, 2);
    assert_eq!(link.lock_mutable().flow.total_deliveries, 2);
}

/// Scenario 5: the core thread settles the delivery between the transport
/// call's lock release and reacquire. The race loop re-invokes the
/// transport with `settled=true`, and the delivery ends up `Nowhere`, not
/// `Unsettled`.
#[test]
fn settlement_race_closes_before_unsettled() {
    let connection = test_connection();
    let link = Arc::new(Link::new(Direction::Outgoing, LinkType::Endpoint, "out", false, false, connection, 10));
    let dlv = delivery(None, false);
    link.lock_mutable().queues.push_undelivered(Arc::clone(&dlv));

    struct SettleOnFirstCall(std::sync::atomic::AtomicBool);
    impl router_core::transport::DeliverHandler for SettleOnFirstCall {
        fn deliver(&self, _link: &Arc<Link>, delivery: &Arc<Delivery>, _settled: bool) -> u64 {
            if !self.0.swap(true, std::sync::atomic::Ordering::SeqCst) {
                delivery.set_settled(true);
            }
            0
        }
    }
    impl router_core::transport::OfferHandler for SettleOnFirstCall {
        fn offer(&self, _link: &Arc<Link>, _remaining: usize) {}
    }

    let handler = SettleOnFirstCall(std::sync::atomic::AtomicBool::new(false));
    let token = link.connection.io_token();
    let n = router_core::egress::process_deliveries(&link, 5, &handler, &handler, &token);

    assert_eq!(n, 1);
    assert_eq!(dlv.where_tag(), Where::Nowhere);
    assert!(link.lock_mutable().queues.unsettled.is_empty());
}

/// Scenario 6: a link in drain mode with `credit_to_core=7` receives
/// `link_flow(credit=10, drain=false)`. `credit_to_core` resets to 0 then
/// is set to the full delta, one FLOW work unit with `drain_action=Clear`
/// is queued, and the I/O thread is activated because `undelivered` is
/// non-empty.
#[test]
fn drain_exit_resets_credit_and_activates() {
    let connection = test_connection();
    let link = Link::new(Direction::Outgoing, LinkType::Endpoint, "out", false, false, Arc::clone(&connection), 10);
    link.set_owning_addr(Some("q".into()));
    {
        let mut mutable = link.lock_mutable();
        mutable.flow.drain_mode = true;
        mutable.flow.credit_to_core = 7;
        mutable
            .queues
            .push_undelivered(delivery(None, false));
    }

    let delta = {
        let mut mutable = link.lock_mutable();
        router_core::flow::absolute_to_incremental(&mut mutable.flow, 10, true)
    };
    assert_eq!(delta, 10);
    assert_eq!(link.lock_mutable().flow.credit_to_core, 10);

    struct NoPeers;
    impl router_core::forwarder::LinkResolver for NoPeers {
        fn resolve(&self, _handle: router_core::link::LinkHandle) -> Option<Arc<Link>> {
            None
        }
    }

    let outcome = router_core::flow::link_flow_ct(&link, &connection, delta, false, &NoPeers);
    assert!(outcome.activate);
    assert_eq!(connection.activate_count(), 1);

    let mutable = link.lock_mutable();
    assert!(matches!(
        mutable.queues.work_list.back(),
        Some(router_core::link::queue::WorkItem::Flow {
            drain_action: router_core::link::queue::DrainAction::Clear
        })
    ));
}
