//! Action dispatcher (component C7): a single-consumer queue delivering
//! tagged closures-worth-of-data to the core thread.
//!
//! The source uses a true MPSC queue of tagged unions; `std::sync::mpsc`
//! gives the same multi-producer/single-consumer shape without pulling in
//! an async runtime the core thread (a dedicated, blocking OS thread) has
//! no use for.

use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::Arc;

use crate::delivery::{Delivery, DeliveryTag};
use crate::link::LinkHandle;

/// One unit of work handed to the core thread. This crate implements the
/// two arms its in-scope components need; a full router's action enum has
/// many more (management requests, route-table updates, ...).
pub enum ActionKind {
    /// A delivery has arrived on an incoming link.
    LinkDeliver {
        link: LinkHandle,
        delivery: Arc<Delivery>,
        /// `true` iff the message receive is still incomplete.
        more: bool,
        tag: DeliveryTag,
    },
    /// A transport reported new credit (already absolute-to-incremental
    /// converted by the caller) and/or a drain-mode change.
    LinkFlow {
        link: LinkHandle,
        credit: u32,
        drain: bool,
    },
}

impl std::fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::LinkDeliver { link, more, .. } => f
                .debug_struct("LinkDeliver")
                .field("link", link)
                .field("more", more)
                .finish(),
            ActionKind::LinkFlow { link, credit, drain } => f
                .debug_struct("LinkFlow")
                .field("link", link)
                .field("credit", credit)
                .field("drain", drain)
                .finish(),
        }
    }
}

/// A dispatched action, carrying the shutdown-discard bit alongside its
/// payload: each action has a `discard` flag set when the core is
/// shutting down.
#[derive(Debug)]
pub struct Action {
    pub kind: ActionKind,
    pub discard: bool,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self { kind, discard: false }
    }
}

/// The producer half, cloned freely across I/O threads. `Bounded` applies
/// backpressure (a blocking `send`) once the configured capacity is full;
/// `Unbounded` never blocks the producer.
#[derive(Clone)]
enum ActionTx {
    Unbounded(Sender<Action>),
    Bounded(SyncSender<Action>),
}

#[derive(Clone)]
pub struct ActionSender {
    tx: ActionTx,
}

impl ActionSender {
    /// Enqueue an action. Returns `Err` if the core thread has shut down
    /// and dropped its receiver; callers should treat that as "discard."
    pub fn send(&self, kind: ActionKind) -> Result<(), ActionKind> {
        let action = Action::new(kind);
        match &self.tx {
            ActionTx::Unbounded(tx) => tx.send(action).map_err(|e| e.0.kind),
            ActionTx::Bounded(tx) => tx.send(action).map_err(|e| e.0.kind),
        }
    }
}

/// The core thread's consuming half.
pub struct ActionReceiver {
    rx: Receiver<Action>,
}

impl ActionReceiver {
    /// Block until the next action arrives, or return `None` once every
    /// sender has been dropped.
    pub fn recv(&self) -> Option<Action> {
        self.rx.recv().ok()
    }
}

/// Construct a fresh action channel. `capacity == 0` builds an unbounded
/// `std::sync::mpsc::channel`; any other value builds a `sync_channel` of
/// that capacity, per [`crate::config::CoreConfig::action_queue_capacity`].
pub fn channel(capacity: usize) -> (ActionSender, ActionReceiver) {
    if capacity == 0 {
        let (tx, rx) = std::sync::mpsc::channel();
        (ActionSender { tx: ActionTx::Unbounded(tx) }, ActionReceiver { rx })
    } else {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        (ActionSender { tx: ActionTx::Bounded(tx) }, ActionReceiver { rx })
    }
}

/// Mark every action still buffered in `rx` as discarded and drop it,
/// without touching any other live state: the shutdown cancellation
/// policy is that handlers release all owned resources and perform no
/// state changes except freeing.
pub fn discard_remaining(rx: &ActionReceiver) {
    while let Ok(action) = rx.rx.try_recv() {
        drop(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TestMessage;

    #[test]
    fn send_and_recv_round_trip() {
        let (tx, rx) = channel(0);
        let delivery = Delivery::new(
            Box::new(TestMessage::complete()),
            None,
            None,
            false,
            false,
            0,
            0,
            DeliveryTag::new(b"t").unwrap(),
            LinkHandle::dangling(),
        );
        tx.send(ActionKind::LinkDeliver {
            link: LinkHandle::dangling(),
            delivery,
            more: false,
            tag: DeliveryTag::new(b"t").unwrap(),
        })
        .unwrap();
        let action = rx.recv().unwrap();
        assert!(!action.discard);
        assert!(matches!(action.kind, ActionKind::LinkDeliver { .. }));
    }

    #[test]
    fn recv_returns_none_once_senders_dropped() {
        let (tx, rx) = channel(0);
        drop(tx);
        assert!(rx.recv().is_none());
    }

    #[test]
    fn bounded_channel_delivers_up_to_capacity() {
        let (tx, rx) = channel(1);
        tx.send(ActionKind::LinkFlow {
            link: LinkHandle::dangling(),
            credit: 1,
            drain: false,
        })
        .unwrap();
        let action = rx.recv().unwrap();
        assert!(matches!(action.kind, ActionKind::LinkFlow { .. }));
    }
}
