use super::page::PageKey;
use crate::Error;
use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

/// Final state of an in-flight fetch, observed identically by every
/// subscriber.
#[derive(Clone, Debug)]
pub(super) enum Outcome {
    /// The fetch completed; the page is resident unless the cache was
    /// reconfigured while it was on the wire. Waiters re-consult the LRU.
    Fetched,
    /// The fetch failed; every waiter aborts with this error.
    Failed(Arc<Error>),
    /// The producer was dropped without resolving (the initiating call was
    /// cancelled mid-fetch). The first waiter to observe this removes the
    /// stale entry and retries the page.
    Abandoned,
}

/// Completion handle shared by every waiter on one in-flight fetch.
///
/// Boxed and [Shared] so any number of callers can clone it out of the map
/// and await the same resolution.
pub(super) type Subscriber = Shared<Pin<Box<dyn Future<Output = Outcome> + Send>>>;

/// Producer endpoint for one in-flight fetch. Exactly one exists per entry.
/// Dropping it without [InFlightMap::resolve] surfaces [Outcome::Abandoned]
/// to subscribers.
pub(super) struct Producer {
    key: PageKey,
    tx: oneshot::Sender<Outcome>,
    subscriber: Subscriber,
}

/// Pages currently being fetched from the device, so that concurrent callers
/// for one missing page coalesce onto a single fetch.
///
/// An entry exists only from the moment a miss is declared until the fetched
/// page is installed or the attempt errors out; a key resident in the LRU is
/// never simultaneously in flight.
pub(super) struct InFlightMap {
    entries: HashMap<PageKey, Subscriber>,
}

impl InFlightMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a fetch for `key` and return its producer endpoint.
    /// Subscribers are handed out by [Self::find].
    ///
    /// # Panics
    ///
    /// Panics if `key` is already in flight. Callers check [Self::find]
    /// within the same critical section before declaring a miss.
    pub fn begin(&mut self, key: PageKey) -> Producer {
        let (tx, rx) = oneshot::channel();
        let subscriber: Subscriber = rx
            .map(|outcome| outcome.unwrap_or(Outcome::Abandoned))
            .boxed()
            .shared();
        let prev = self.entries.insert(key, subscriber.clone());
        assert!(prev.is_none(), "page already in flight");
        Producer {
            key,
            tx,
            subscriber,
        }
    }

    pub fn find(&self, key: &PageKey) -> Option<Subscriber> {
        self.entries.get(key).cloned()
    }

    /// Signal `outcome` to all subscribers and drop the entry. On success the
    /// caller installs the page in the same critical section, so a waiter
    /// that wakes always observes either residency or a clean miss.
    ///
    /// Only the producer's own entry is dropped: if the map was cleared by a
    /// reconfiguration and the key re-registered, the younger entry stays.
    pub fn resolve(&mut self, producer: Producer, outcome: Outcome) {
        if let Some(current) = self.entries.get(&producer.key) {
            if current.ptr_eq(&producer.subscriber) {
                self.entries.remove(&producer.key);
            }
        }
        // Every subscriber may already have gone away.
        let _ = producer.tx.send(outcome);
    }

    /// Drop the entry for `key` if it is still the abandoned `subscriber`.
    /// Restores the map's invariant after a producer's task was cancelled.
    pub fn remove_abandoned(&mut self, key: &PageKey, subscriber: &Subscriber) {
        if let Some(current) = self.entries.get(key) {
            if current.ptr_eq(subscriber) {
                self.entries.remove(key);
            }
        }
    }

    /// Drop every entry. Outstanding producers resolve into the void; their
    /// waiters re-consult the cache and start over.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
