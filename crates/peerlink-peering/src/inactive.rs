//! Known peers without a connection.
//!
//! An identity that was just popped for dialing, or promoted to active,
//! cools down for a random window; adds during that window are ignored.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_transport::{NodeAddress, NodeIdentity};
use rand::Rng;
use rand::seq::IteratorRandom;
use tokio_util::sync::CancellationToken;

/// Default cool-down window.
pub const DEFAULT_COOLDOWN: Range<Duration> = Duration::from_secs(20)..Duration::from_secs(40);

#[derive(Debug, Default)]
struct State {
    entries: HashMap<NodeIdentity, NodeAddress>,
    cooling: HashMap<NodeIdentity, u64>,
    next_stamp: u64,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    cooldown: Range<Duration>,
    closed: CancellationToken,
}

/// Store of inactive peers. Cloning shares the store.
#[derive(Debug, Clone)]
pub struct InactivePeerStore {
    inner: Arc<Inner>,
}

impl Default for InactivePeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InactivePeerStore {
    /// Creates a store with the default cool-down window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cooldown(DEFAULT_COOLDOWN)
    }

    /// Creates a store whose cool-down is drawn uniformly from `window`.
    #[must_use]
    pub fn with_cooldown(window: Range<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cooldown: window,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Records `addr`. No-op while its identity cools down or after close.
    /// Returns true if the address was stored.
    pub fn add(&self, addr: NodeAddress) -> bool {
        if self.inner.closed.is_cancelled() {
            return false;
        }
        let mut state = self.inner.state.lock();
        if state.cooling.contains_key(&addr.identity()) {
            return false;
        }
        state.entries.insert(addr.identity(), addr);
        true
    }

    /// Returns a random entry without removing it.
    #[must_use]
    pub fn random(&self) -> Option<NodeAddress> {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Returns a random entry other than `excluded`.
    #[must_use]
    pub fn random_except(&self, excluded: &NodeIdentity) -> Option<NodeAddress> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .filter(|(identity, _)| *identity != excluded)
            .choose(&mut rand::thread_rng())
            .map(|(_, addr)| addr.clone())
    }

    /// Removes a random entry and starts its cool-down.
    ///
    /// Must be called within a Tokio runtime.
    pub fn random_pop(&self) -> Option<NodeAddress> {
        let addr = {
            let mut state = self.inner.state.lock();
            let identity = *state.entries.keys().choose(&mut rand::thread_rng())?;
            state.entries.remove(&identity)?
        };
        self.start_cooldown(addr.identity());
        Some(addr)
    }

    /// Removes `addr` and starts its cool-down.
    ///
    /// Must be called within a Tokio runtime.
    pub fn del(&self, addr: &NodeAddress) {
        self.inner.state.lock().entries.remove(&addr.identity());
        self.start_cooldown(addr.identity());
    }

    fn start_cooldown(&self, identity: NodeIdentity) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        let stamp = {
            let mut state = self.inner.state.lock();
            state.next_stamp = state.next_stamp.wrapping_add(1);
            let stamp = state.next_stamp;
            state.cooling.insert(identity, stamp);
            stamp
        };
        let window = &self.inner.cooldown;
        let wait = if window.start < window.end {
            rand::thread_rng().gen_range(window.clone())
        } else {
            window.start
        };
        let store = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = store.inner.closed.cancelled() => {}
                () = tokio::time::sleep(wait) => {
                    let mut state = store.inner.state.lock();
                    if state.cooling.get(&identity) == Some(&stamp) {
                        state.cooling.remove(&identity);
                    }
                }
            }
        });
    }

    /// Returns true if an entry for `identity` is stored.
    #[must_use]
    pub fn contains(&self, identity: &NodeIdentity) -> bool {
        self.inner.state.lock().entries.contains_key(identity)
    }

    /// Returns true while `identity` cools down.
    #[must_use]
    pub fn is_cooling(&self, identity: &NodeIdentity) -> bool {
        self.inner.state.lock().cooling.contains_key(identity)
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops cool-down timers and empties the store. Idempotent.
    pub fn close(&self) {
        self.inner.closed.cancel();
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.cooling.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_transport::StaticKey;

    fn make_addr() -> NodeAddress {
        NodeAddress::new(1, StaticKey::generate().identity(), "127.0.0.1", 4100)
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_pop_is_ignored_during_cooldown() {
        let store = InactivePeerStore::new();
        let addr = make_addr();
        assert!(store.add(addr.clone()));

        let popped = store.random_pop().expect("entry");
        assert_eq!(popped, addr);
        assert!(!store.add(addr.clone()));
        assert!(store.is_empty());
        assert!(store.is_cooling(&addr.identity()));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires_within_window() {
        let store = InactivePeerStore::new();
        let addr = make_addr();
        store.add(addr.clone());
        store.random_pop();

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(!store.add(addr.clone()));

        tokio::time::sleep(Duration::from_secs(22)).await;
        assert!(store.add(addr.clone()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn del_starts_cooldown() {
        let store = InactivePeerStore::new();
        let addr = make_addr();
        store.add(addr.clone());
        store.del(&addr);
        assert!(!store.contains(&addr.identity()));
        assert!(!store.add(addr));
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_cooldown_is_not_cut_short() {
        let store = InactivePeerStore::with_cooldown(Duration::from_secs(10)..Duration::from_secs(10));
        let addr = make_addr();
        store.del(&addr);
        tokio::time::sleep(Duration::from_secs(6)).await;
        store.del(&addr);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_cooling(&addr.identity()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!store.is_cooling(&addr.identity()));
    }

    #[tokio::test(start_paused = true)]
    async fn random_peeks_without_removing() {
        let store = InactivePeerStore::new();
        assert!(store.random().is_none());
        assert!(store.random_pop().is_none());
        let addr = make_addr();
        store.add(addr.clone());
        assert_eq!(store.random(), Some(addr.clone()));
        assert!(store.random_except(&addr.identity()).is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_empties_and_refuses_adds() {
        let store = InactivePeerStore::new();
        store.add(make_addr());
        store.close();
        assert!(store.is_empty());
        assert!(!store.add(make_addr()));
    }
}
