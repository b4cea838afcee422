//! Fan-out of decoded messages to subscribers.
//!
//! A [`Router`] holds a list of subscriptions, each a [`MessageFilter`] plus a handler.
//! [`dispatch`](Router::dispatch) runs matching handlers synchronously in registration
//! order on the caller's thread. A handler error is collected and returned, it never stops
//! delivery to the remaining subscribers.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::frame::Message;
use crate::Error;

/// Handle returned by [`Router::subscribe`], used to unsubscribe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Which decoded messages a subscription wants.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageFilter {
    All,
    /// J1587 messages with one of these MIDs.
    Mids(BTreeSet<u8>),
    /// J1939 messages with one of these PGNs.
    Pgns(BTreeSet<u32>),
    /// J1939 messages from one of these source addresses.
    SourceAddrs(BTreeSet<u8>),
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            MessageFilter::All => true,
            MessageFilter::Mids(mids) => message.mid().is_some_and(|mid| mids.contains(&mid)),
            MessageFilter::Pgns(pgns) => message.pgn().is_some_and(|pgn| pgns.contains(&pgn)),
            MessageFilter::SourceAddrs(addrs) => message
                .source_address()
                .is_some_and(|sa| addrs.contains(&sa)),
        }
    }
}

type Handler = Box<dyn FnMut(&Message) -> crate::Result<()> + Send>;

struct Subscription {
    id: SubscriptionId,
    filter: MessageFilter,
    // Each handler behind its own lock: the registry lock is never held while a handler
    // runs, so handlers may subscribe or unsubscribe and dispatch calls from different
    // transports proceed in parallel
    handler: Arc<Mutex<Handler>>,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

/// Synchronous message dispatcher. All methods take `&self`, the subscription list is
/// guarded internally.
#[derive(Default)]
pub struct Router {
    inner: Mutex<Inner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a handler panicked mid-dispatch, the list is intact
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(
        &self,
        filter: MessageFilter,
        handler: impl FnMut(&Message) -> crate::Result<()> + Send + 'static,
    ) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscriptions.push(Subscription {
            id,
            filter,
            handler: Arc::new(Mutex::new(Box::new(handler))),
        });
        id
    }

    /// Remove a subscription. Returns false if the id was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        inner.subscriptions.len() != before
    }

    /// Deliver a message to every matching subscriber, in registration order. Returns the
    /// errors handlers produced, paired with the failing subscription's id.
    ///
    /// The subscriber set is snapshotted up front: a handler unsubscribed by another
    /// thread mid-dispatch may still see this message.
    pub fn dispatch(&self, message: &Message) -> Vec<(SubscriptionId, Error)> {
        let matching: Vec<(SubscriptionId, Arc<Mutex<Handler>>)> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.filter.matches(message))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut errors = Vec::new();
        for (id, handler) in matching {
            let mut handler = match handler.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = (*handler)(message) {
                debug!("handler {:?} failed: {}", id, e);
                errors.push((id, e));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::j1939::{Destination, J1939Message};
    use std::sync::mpsc::channel;
    use std::time::SystemTime;

    fn engine_message(pgn: u32, sa: u8) -> Message {
        Message::J1939(J1939Message {
            pgn,
            sa,
            destination: Destination::Broadcast,
            priority: 6,
            data: vec![0; 8],
            timestamp: SystemTime::now(),
        })
    }

    #[test]
    fn matching_subscribers_run_in_registration_order() {
        let router = Router::new();
        let (tx, rx) = channel();

        let tx1 = tx.clone();
        router.subscribe(MessageFilter::Pgns(BTreeSet::from([61444])), move |_| {
            tx1.send("first").map_err(|_| Error::Disconnected)
        });
        let tx2 = tx.clone();
        router.subscribe(MessageFilter::All, move |_| {
            tx2.send("second").map_err(|_| Error::Disconnected)
        });
        router.subscribe(MessageFilter::Pgns(BTreeSet::from([65262])), move |_| {
            panic!("must not match")
        });

        let errors = router.dispatch(&engine_message(61444, 0x00));
        assert!(errors.is_empty());
        assert_eq!(rx.try_recv(), Ok("first"));
        assert_eq!(rx.try_recv(), Ok("second"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handler_error_does_not_stop_fanout() {
        let router = Router::new();
        let (tx, rx) = channel();

        let failing = router.subscribe(MessageFilter::All, |_| Err(Error::Timeout));
        router.subscribe(MessageFilter::All, move |_| {
            tx.send(()).map_err(|_| Error::Disconnected)
        });

        let errors = router.dispatch(&engine_message(61444, 0x00));
        assert_eq!(errors, vec![(failing, Error::Timeout)]);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let router = Router::new();
        let id = router.subscribe(MessageFilter::All, |_| Err(Error::Timeout));

        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        assert!(router.dispatch(&engine_message(61444, 0x00)).is_empty());
    }

    #[test]
    fn handler_may_unsubscribe_itself_mid_dispatch() {
        let router = Arc::new(Router::new());
        let slot = Arc::new(Mutex::new(None));

        let router2 = Arc::clone(&router);
        let slot2 = Arc::clone(&slot);
        let id = router.subscribe(MessageFilter::All, move |_| {
            if let Some(id) = *slot2.lock().unwrap() {
                router2.unsubscribe(id);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        // Must not deadlock on the registry lock
        assert!(router.dispatch(&engine_message(61444, 0x00)).is_empty());
        assert!(!router.unsubscribe(id));
    }

    #[test]
    fn source_address_filter() {
        let router = Router::new();
        let (tx, rx) = channel();
        router.subscribe(MessageFilter::SourceAddrs(BTreeSet::from([0x00])), move |m| {
            tx.send(m.source_address()).map_err(|_| Error::Disconnected)
        });

        router.dispatch(&engine_message(61444, 0x00));
        router.dispatch(&engine_message(61444, 0x17));
        assert_eq!(rx.try_recv(), Ok(Some(0x00)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn mid_filter_ignores_j1939_messages() {
        let router = Router::new();
        router.subscribe(MessageFilter::Mids(BTreeSet::from([128])), |_| {
            panic!("must not match a J1939 message")
        });
        assert!(router.dispatch(&engine_message(61444, 0x00)).is_empty());
    }
}
