//! Link work queue (component C2): the FIFO of flow/delivery units attached
//! to a link, drained by its connection's I/O thread.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::delivery::{Delivery, Where};

/// What a drain-mode change asks the sender to do, carried on the link's
/// `work_list`: leaving drain mode queues one FLOW work unit with
/// `drain_action = Clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainAction {
    /// No drain-mode change; this work item is a plain flow update.
    None,
    /// Drain mode was just entered.
    Set,
    /// Drain mode was just cleared.
    Clear,
}

/// A unit queued on a link's `work_list`, processed by the connection's I/O
/// thread independently of the delivery lists.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// A FLOW frame should be sent reflecting the link's current credit
    /// state.
    Flow {
        /// See [`DrainAction`].
        drain_action: DrainAction,
    },
}

/// The three delivery lists plus the work list attached to a link.
/// Membership in `undelivered`/`unsettled`/`settled` is mutually exclusive;
/// the push/pop helpers below are the sole mutators, so that invariant and
/// the `where` tag stay in lock-step -- a typed list abstraction whose
/// insert/remove operations perform the matching incref/decref.
#[derive(Debug, Default)]
pub struct LinkQueues {
    /// Deliveries awaiting transmission.
    pub undelivered: VecDeque<Arc<Delivery>>,
    /// Deliveries transmitted but not yet settled.
    pub unsettled: VecDeque<Arc<Delivery>>,
    /// Deliveries kept only to preserve peer linkage.
    pub settled: VecDeque<Arc<Delivery>>,
    /// Pending FLOW work units.
    pub work_list: VecDeque<WorkItem>,
}

impl LinkQueues {
    /// Push onto `undelivered`, taking over the single ref the caller was
    /// holding.
    pub fn push_undelivered(&mut self, delivery: Arc<Delivery>) {
        delivery.set_where(Where::Undelivered);
        self.undelivered.push_back(delivery);
    }

    /// Pop the head of `undelivered` without clearing its `where` tag --
    /// callers must either re-park it (rare) or move it onward themselves.
    pub fn peek_undelivered(&self) -> Option<&Arc<Delivery>> {
        self.undelivered.front()
    }

    /// Remove the head of `undelivered`. Ownership of the list's ref
    /// transfers to the caller, who must hand it to exactly one of
    /// `push_unsettled`, `push_settled`, or drop it (after calling
    /// `set_where(Nowhere)`).
    pub fn pop_undelivered(&mut self) -> Option<Arc<Delivery>> {
        self.undelivered.pop_front()
    }

    /// Push onto `unsettled`.
    pub fn push_unsettled(&mut self, delivery: Arc<Delivery>) {
        delivery.set_where(Where::Unsettled);
        self.unsettled.push_back(delivery);
    }

    /// Push onto `settled` (used to retain peer linkage, not to mean the
    /// delivery's own settlement state).
    pub fn push_settled(&mut self, delivery: Arc<Delivery>) {
        delivery.set_where(Where::Settled);
        self.settled.push_back(delivery);
    }

    /// Remove `delivery` from `unsettled` by tag match, used when a
    /// disposition settles it.
    pub fn remove_unsettled(&mut self, tag: &[u8]) -> Option<Arc<Delivery>> {
        let idx = self
            .unsettled
            .iter()
            .position(|d| d.tag.as_slice() == tag)?;
        self.unsettled.remove(idx)
    }

    /// Take the entire `undelivered` list out, leaving it empty. Used by
    /// `drain_inbound_undelivered`, which moves the list to a local
    /// variable first so that re-parking a delivery doesn't cause an
    /// infinite loop.
    pub fn take_undelivered(&mut self) -> VecDeque<Arc<Delivery>> {
        std::mem::take(&mut self.undelivered)
    }
}
