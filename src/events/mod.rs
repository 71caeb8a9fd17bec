//! The observable event surface of the engine.
//!
//! A single [`EventHub`] doubles as the host-facing notification stream
//! and, in the off-chain transport, as the bus peers receive
//! [`DkgEvent::Data`] broadcasts through. The engine never relies on
//! hearing its own broadcasts back: the round manager queues a local
//! copy of everything it emits, and the bounded per-phase stores make
//! any echo a no-op.

use std::sync::{Arc, Mutex};

use crate::channel::{self, ChannelMixedRx, ChannelMixedTx};
use crate::messages::DkgMessage;
use crate::ordering::{Height, RoundId};

/// Everything the engine reports to the outside world.
#[derive(Clone, Debug)]
pub enum DkgEvent {
    /// A signed protocol message leaving this node.
    Data(DkgMessage),
    Start(RoundId),
    PubKeyReceived,
    DealsProcessed(RoundId),
    ResponsesProcessed(RoundId),
    JustificationsProcessed(RoundId),
    InstanceCertified(RoundId),
    CommitsProcessed(RoundId),
    ComplaintProcessed(RoundId),
    ReconstructCommitsProcessed(RoundId),
    /// A round computed a verifier; it activates at the carried height.
    Successful { change_height: Height },
    /// The active verifier was swapped at the carried height.
    KeyChange { height: Height },
}

impl DkgEvent {
    /// Whether this event carries a wire message for peers.
    pub fn is_data(&self) -> bool {
        matches!(self, DkgEvent::Data(_))
    }
}

/// Fan-out of [`DkgEvent`]s to any number of subscribers.
pub struct EventHub {
    subscribers: Mutex<Vec<ChannelMixedTx<DkgEvent>>>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Registers a new subscriber with a receive queue of `capacity`.
    pub fn subscribe(&self, capacity: usize) -> ChannelMixedRx<DkgEvent> {
        let (tx, rx) = channel::new_bounded_mixed(capacity);

        self.subscribers
            .lock()
            .expect("event hub lock poisoned")
            .push(tx);

        rx
    }

    /// Delivers `event` to every live subscriber.
    ///
    /// Subscribers that went away are pruned; a full subscriber queue
    /// blocks the send, the same policy the message channels apply.
    pub fn fire(&self, event: DkgEvent) {
        let mut subscribers = self.subscribers.lock().expect("event hub lock poisoned");

        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::RoundId;

    #[test]
    fn every_subscriber_sees_every_event() {
        let hub = EventHub::new();

        let first = hub.subscribe(8);
        let second = hub.subscribe(8);

        hub.fire(DkgEvent::Start(RoundId::ONE));

        assert!(matches!(first.recv().unwrap(), DkgEvent::Start(round) if round == RoundId::ONE));
        assert!(matches!(second.recv().unwrap(), DkgEvent::Start(round) if round == RoundId::ONE));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = EventHub::new();

        let keep = hub.subscribe(8);
        drop(hub.subscribe(8));

        hub.fire(DkgEvent::PubKeyReceived);
        hub.fire(DkgEvent::PubKeyReceived);

        assert_eq!(keep.len(), 2);
    }
}
