//! Deduplicated outbound gossip queue for one peer.
//!
//! Messages are identified by a keyed BLAKE3 hash. A bounded LRU remembers
//! recent hashes; a message whose hash is remembered is never queued again.
//! Evicting a hash cancels its pending delivery. Every hash is forgotten
//! five message timeouts after it was recorded, and each delivery gives up
//! after four.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::caller::BoxFuture;
use crate::error::CallError;
use crate::queue::SharedQueue;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_JITTER_MS: u64 = 128;

/// Per-process secret keying the deduplication hash.
#[derive(Clone, PartialEq, Eq)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    /// Draws a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Uses fixed key bytes.
    #[must_use]
    pub const fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }

    /// Hashes a message body.
    #[must_use]
    pub fn hash(&self, body: &[u8]) -> blake3::Hash {
        blake3::keyed_hash(&self.0, body)
    }
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DedupKey(..)")
    }
}

/// Performs one delivery attempt.
pub type DeliverFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), CallError>> + Send + Sync>;

struct Task {
    hash: blake3::Hash,
    entry_id: u64,
    token: CancellationToken,
    deliver: DeliverFn,
    deadline: Instant,
}

struct Expiry {
    hash: blake3::Hash,
    entry_id: u64,
    clean_at: Instant,
}

struct Entry {
    id: u64,
    task: Option<Arc<Task>>,
}

struct State {
    lru: LruCache<blake3::Hash, Entry>,
    next_id: u64,
    draining: bool,
}

struct Inner {
    key: DedupKey,
    msg_timeout: Duration,
    state: Mutex<State>,
    next: SharedQueue<Arc<Task>>,
    expiries: mpsc::UnboundedSender<Expiry>,
    closed: CancellationToken,
}

/// Outbound queue for one peer. Cloning shares the queue.
#[derive(Clone)]
pub struct MsgQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for MsgQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQueue")
            .field("tracked", &self.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl MsgQueue {
    /// Creates a queue remembering up to `capacity` hashes with `workers`
    /// delivery workers and `workers / 2` (at least one) expiry workers.
    /// Cancelling `closed` drains the queue.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(
        capacity: usize,
        workers: usize,
        key: DedupKey,
        msg_timeout: Duration,
        closed: CancellationToken,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let (expiries, expiry_rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Inner {
                key,
                msg_timeout,
                state: Mutex::new(State {
                    lru: LruCache::new(capacity),
                    next_id: 0,
                    draining: false,
                }),
                next: SharedQueue::new(capacity.get()),
                expiries,
                closed,
            }),
        };

        for _ in 0..workers.max(1) {
            tokio::spawn(queue.clone().delivery_worker());
        }
        let expiry_rx = Arc::new(tokio::sync::Mutex::new(expiry_rx));
        for _ in 0..(workers / 2).max(1) {
            tokio::spawn(queue.clone().expiry_worker(Arc::clone(&expiry_rx)));
        }
        queue
    }

    /// Queues `body` for delivery unless its hash is already tracked.
    /// Returns true if a delivery was queued.
    ///
    /// Waits for room in the queue, or until the peer closes.
    pub async fn add(&self, body: &[u8], deliver: DeliverFn) -> bool {
        let hash = self.inner.key.hash(body);
        let now = Instant::now();
        let task = {
            let mut state = self.inner.state.lock();
            if state.draining || state.lru.contains(&hash) {
                return false;
            }
            let entry_id = self.track(&mut state, hash, now);
            let task = Arc::new(Task {
                hash,
                entry_id,
                token: self.inner.closed.child_token(),
                deliver,
                deadline: now + self.inner.msg_timeout * 4,
            });
            if let Some(entry) = state.lru.peek_mut(&hash) {
                entry.task = Some(Arc::clone(&task));
            }
            task
        };

        tokio::select! {
            () = self.inner.closed.cancelled() => false,
            queued = self.inner.next.push(task) => queued,
        }
    }

    /// Marks `body` as known without delivering it, so later adds of the
    /// same content are ignored. Used for gossip received from this peer.
    pub fn prevent(&self, body: &[u8]) {
        let hash = self.inner.key.hash(body);
        let mut state = self.inner.state.lock();
        if state.draining || state.lru.contains(&hash) {
            return;
        }
        self.track(&mut state, hash, Instant::now());
    }

    /// Returns true if `body`'s hash is tracked.
    #[must_use]
    pub fn contains(&self, body: &[u8]) -> bool {
        let hash = self.inner.key.hash(body);
        let state = self.inner.state.lock();
        !state.draining && state.lru.contains(&hash)
    }

    /// Number of tracked hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().lru.len()
    }

    /// True if no hash is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `hash`, cancelling whatever the LRU evicts, and schedules its
    /// expiry. Returns the entry id.
    fn track(&self, state: &mut State, hash: blake3::Hash, now: Instant) -> u64 {
        state.next_id = state.next_id.wrapping_add(1);
        let id = state.next_id;
        if let Some((evicted_hash, evicted)) = state.lru.push(hash, Entry { id, task: None }) {
            if let Some(task) = evicted.task {
                trace!(hash = %evicted_hash.to_hex(), "Evicting queued gossip");
                task.token.cancel();
            }
        }
        let _ = self.inner.expiries.send(Expiry {
            hash,
            entry_id: id,
            clean_at: now + self.inner.msg_timeout * 5,
        });
        id
    }

    fn expire(&self, expiry: &Expiry) {
        let mut state = self.inner.state.lock();
        let current = state
            .lru
            .peek(&expiry.hash)
            .is_some_and(|entry| entry.id == expiry.entry_id);
        if current {
            if let Some(entry) = state.lru.pop(&expiry.hash) {
                if let Some(task) = entry.task {
                    task.token.cancel();
                }
            }
        }
    }

    /// Drops the finished task but keeps its hash tracked.
    fn finish(&self, task: &Task) {
        task.token.cancel();
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.lru.peek_mut(&task.hash) {
            if entry.id == task.entry_id {
                entry.task = None;
            }
        }
    }

    fn drain(&self) {
        let mut state = self.inner.state.lock();
        if state.draining {
            return;
        }
        state.draining = true;
        while let Some((_, entry)) = state.lru.pop_lru() {
            if let Some(task) = entry.task {
                task.token.cancel();
            }
        }
        debug!("Drained gossip queue");
    }

    async fn delivery_worker(self) {
        loop {
            let task = tokio::select! {
                () = self.inner.closed.cancelled() => return,
                task = self.inner.next.pop() => match task {
                    Some(task) => task,
                    None => return,
                },
            };
            if task.token.is_cancelled() || Instant::now() >= task.deadline {
                self.finish(&task);
                continue;
            }
            let _ = tokio::time::timeout_at(task.deadline, self.send_with_retry(&task)).await;
            self.finish(&task);
        }
    }

    async fn send_with_retry(&self, task: &Task) {
        let max_backoff = self.inner.msg_timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MS));
                backoff = backoff * 2 + jitter;
                if backoff > max_backoff {
                    backoff = max_backoff.saturating_sub(jitter);
                }
                tokio::select! {
                    () = task.token.cancelled() => return,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
            attempt += 1;

            let result = tokio::select! {
                () = task.token.cancelled() => return,
                result = (task.deliver)() => result,
            };
            match result {
                Ok(()) => return,
                Err(e) if e.is_invalid() => {
                    debug!(error = %e, "Gossip rejected as invalid");
                    return;
                }
                Err(e) => {
                    trace!(error = %e, attempt, "Gossip delivery failed; retrying");
                }
            }
        }
    }

    async fn expiry_worker(self, expiries: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Expiry>>>) {
        loop {
            let expiry = tokio::select! {
                () = self.inner.closed.cancelled() => break,
                expiry = async { expiries.lock().await.recv().await } => match expiry {
                    Some(expiry) => expiry,
                    None => break,
                },
            };
            tokio::select! {
                () = self.inner.closed.cancelled() => break,
                () = tokio::time::sleep_until(expiry.clean_at) => self.expire(&expiry),
            }
        }
        self.drain();
    }
}

#[cfg(test)]
#[path = "msgq_tests.rs"]
mod tests;
