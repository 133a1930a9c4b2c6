//! Peers with a live multiplexed connection.
//!
//! Entries are keyed by identity. Each accepted entry carries a random
//! non-zero stamp; the cleanup task spawned for it only deletes the entry if
//! the stamp is unchanged, so a late cleanup never removes a newer
//! connection under the same identity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use peerlink_transport::{NodeAddress, NodeIdentity};
use rand::seq::IteratorRandom;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A connection that can live in the active store.
pub trait ActiveEntry: Clone + Send + Sync + 'static {
    /// Identity of the remote node.
    fn identity(&self) -> NodeIdentity;

    /// Address of the remote node.
    fn node_addr(&self) -> &NodeAddress;

    /// Fires when the connection closes.
    fn close_signal(&self) -> CancellationToken;

    /// Closes the connection.
    fn close(&self);

    /// Returns true once the connection has closed.
    fn is_closed(&self) -> bool {
        self.close_signal().is_cancelled()
    }
}

#[derive(Debug)]
struct Slot<T> {
    entry: T,
    stamp: u64,
}

#[derive(Debug)]
struct StoreInner<T> {
    entries: Mutex<HashMap<NodeIdentity, Slot<T>>>,
    owns_connections: bool,
    closed: CancellationToken,
}

/// Store of active peers. Cloning shares the store.
#[derive(Debug)]
pub struct ActivePeerStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for ActivePeerStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn fresh_stamp() -> u64 {
    loop {
        let stamp = rand::random::<u64>();
        if stamp != 0 {
            return stamp;
        }
    }
}

impl<T: ActiveEntry> ActivePeerStore<T> {
    /// Creates a store. If `owns_connections` is set, deleting an entry or
    /// closing the store closes the connection.
    #[must_use]
    pub fn new(owns_connections: bool) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                owns_connections,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Adds a connection. Returns false, and closes `entry`, if a live
    /// connection for the same identity is already stored or the store is
    /// closed. A stored connection that has already closed is replaced.
    ///
    /// Must be called within a Tokio runtime.
    pub fn add(&self, entry: T) -> bool {
        let identity = entry.identity();
        let stamp = {
            let mut entries = self.inner.entries.lock();
            let duplicate = entries
                .get(&identity)
                .is_some_and(|slot| !slot.entry.is_closed());
            if self.inner.closed.is_cancelled() || duplicate {
                None
            } else {
                let stamp = fresh_stamp();
                entries.insert(
                    identity,
                    Slot {
                        entry: entry.clone(),
                        stamp,
                    },
                );
                Some(stamp)
            }
        };

        let Some(stamp) = stamp else {
            debug!(peer = %entry.node_addr(), "Rejecting duplicate active peer");
            entry.close();
            return false;
        };

        let store = self.clone();
        let signal = entry.close_signal();
        tokio::spawn(async move {
            tokio::select! {
                () = store.inner.closed.cancelled() => {}
                () = signal.cancelled() => {
                    store.remove_if_stamp(identity, stamp);
                }
            }
        });
        true
    }

    fn remove_if_stamp(&self, identity: NodeIdentity, stamp: u64) {
        let mut entries = self.inner.entries.lock();
        if entries.get(&identity).is_some_and(|slot| slot.stamp == stamp) {
            entries.remove(&identity);
            debug!(peer = %identity.short(), "Removed closed active peer");
        }
    }

    /// Removes the entry for `identity`, closing it if the store owns
    /// connections.
    pub fn del(&self, identity: &NodeIdentity) -> Option<T> {
        let slot = self.inner.entries.lock().remove(identity)?;
        if self.inner.owns_connections {
            slot.entry.close();
        }
        Some(slot.entry)
    }

    /// Returns true if a connection for `identity` is stored.
    #[must_use]
    pub fn contains(&self, identity: &NodeIdentity) -> bool {
        self.inner.entries.lock().contains_key(identity)
    }

    /// The entry for `identity`.
    #[must_use]
    pub fn get(&self, identity: &NodeIdentity) -> Option<T> {
        self.inner
            .entries
            .lock()
            .get(identity)
            .map(|slot| slot.entry.clone())
    }

    /// A uniformly random entry.
    #[must_use]
    pub fn random(&self) -> Option<T> {
        self.inner
            .entries
            .lock()
            .values()
            .choose(&mut rand::thread_rng())
            .map(|slot| slot.entry.clone())
    }

    /// A uniformly random entry other than `excluded`.
    #[must_use]
    pub fn random_except(&self, excluded: &NodeIdentity) -> Option<T> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(identity, _)| *identity != excluded)
            .choose(&mut rand::thread_rng())
            .map(|(_, slot)| slot.entry.clone())
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<T> {
        self.inner
            .entries
            .lock()
            .values()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// True if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops cleanup tasks, empties the store and closes owned connections.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.closed.cancel();
        let drained: Vec<T> = self
            .inner
            .entries
            .lock()
            .drain()
            .map(|(_, slot)| slot.entry)
            .collect();
        if self.inner.owns_connections {
            for entry in drained {
                entry.close();
            }
        }
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

#[cfg(test)]
#[path = "active_tests.rs"]
mod tests;
