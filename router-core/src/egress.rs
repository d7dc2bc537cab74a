//! Egress transmit loop (component C6, `process_deliveries`): drains an
//! outgoing link's `undelivered` list under its connection's proactor
//! token, invoking the transport and settling the race between the core
//! thread's settlement propagation and an in-flight transmit.

use std::sync::Arc;

use tracing::{instrument, trace};

use crate::connection::ConnectionToken;
use crate::delivery::{Delivery, Where};
use crate::link::Link;
use crate::transport::{DeliverHandler, OfferHandler};

/// Drain up to `credit` deliveries from `link`'s `undelivered` list,
/// transmitting each via `deliver_handler`. Returns the number fully
/// transmitted. `_token` proves the caller holds this link's connection's
/// proactor token -- no two egress passes for the same connection can run
/// concurrently.
#[instrument(skip(link, deliver_handler, offer_handler, _token))]
pub fn process_deliveries(
    link: &Arc<Link>,
    mut credit: u32,
    deliver_handler: &dyn DeliverHandler,
    offer_handler: &dyn OfferHandler,
    _token: &ConnectionToken<'_>,
) -> u32 {
    if link.lock_mutable().detach_received {
        return 0;
    }

    let mut completed = 0;
    let mut saw_any = false;

    while credit > 0 {
        let head = {
            let mutable = link.lock_mutable();
            match mutable.queues.peek_undelivered() {
                Some(dlv) => Arc::clone(dlv),
                None => break,
            }
        };
        saw_any = true;

        let new_disposition = settlement_race_deliver(link, &head, deliver_handler);

        if !head.send_complete() {
            trace!("delivery still streaming; leaving at head of undelivered");
            return completed;
        }

        credit -= 1;
        {
            let mut mutable = link.lock_mutable();
            mutable.flow.credit_to_core = mutable.flow.credit_to_core.saturating_sub(1);
            mutable.flow.total_deliveries += 1;
            if mutable.queues.undelivered.is_empty() {
                // The link may have detached concurrently with this pass;
                // nothing left to drain.
                drop(mutable);
                return completed;
            }
        }

        {
            let mut mutable = link.lock_mutable();
            let popped = mutable.queues.pop_undelivered();
            debug_assert!(popped.as_ref().map(|d| Arc::ptr_eq(d, &head)).unwrap_or(false));
            if head.is_settled() {
                head.set_where(Where::Nowhere);
            } else {
                mutable.queues.push_unsettled(Arc::clone(&head));
            }
        }

        completed += 1;

        if new_disposition != 0 {
            crate::delivery::update_disposition_ct(link, &head, new_disposition);
        }
    }

    if saw_any {
        let remaining = link.lock_mutable().queues.undelivered.len();
        offer_handler.offer(link, remaining);
    }

    completed
}

/// Implements the settlement race loop: release the lock before calling
/// into the transport (which may block on socket I/O), then re-check
/// whether the core thread changed `settled` while we were out; if so,
/// call the transport again with the updated flag.
fn settlement_race_deliver(link: &Arc<Link>, delivery: &Arc<Delivery>, deliver_handler: &dyn DeliverHandler) -> u64 {
    loop {
        let settled_before = delivery.is_settled();
        let new_disposition = deliver_handler.deliver(link, delivery, settled_before);
        if delivery.is_settled() == settled_before {
            return new_disposition;
        }
        trace!("settlement changed mid-transmit; re-invoking deliver_handler");
    }
}
