//! Per-peer dispatch bus.
//!
//! Request workers drain the process-wide request queue and call this peer.
//! Each call reports an outcome to a single oversight task that grows the
//! pool on sustained success and shrinks it on sustained timeouts. Once the
//! pool reaches zero the oversight sleeps for a growing backoff before
//! restoring one worker, and a timeout at the highest backoff level closes
//! the peer.
//!
//! Gossip goes through two deduplicated [`MsgQueue`]s, one per
//! [`GossipClass`], each with a fixed number of delivery workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::caller::{BoxFuture, PeerCaller};
use crate::config::{BusConfig, OversightConfig, QueueConfig};
use crate::error::CallError;
use crate::message::{GossipClass, GossipMessage, PeerRequest, PeerResponse};
use crate::msgq::{DedupKey, DeliverFn, MsgQueue};
use crate::queue::SharedQueue;

/// Classification of a finished call for the oversight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The peer answered.
    Success,
    /// The call hit its timeout.
    Timeout,
    /// Any other failure. Ignored by the oversight.
    Other,
}

impl CallOutcome {
    /// Classifies a call result.
    #[must_use]
    pub fn of<T>(result: &Result<T, CallError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(CallError::Timeout) => Self::Timeout,
            Err(_) => Self::Other,
        }
    }
}

/// What the oversight does after recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversightAction {
    /// Nothing.
    Hold,
    /// Start one more worker.
    Grow,
    /// Stop one worker.
    Shrink,
    /// Stop the last worker, wait, then restore one.
    ShrinkAndBackoff(Duration),
    /// Give up on the peer.
    ClosePeer,
}

/// Worker pool state of one bus.
#[derive(Debug, Clone)]
pub struct Oversight {
    config: OversightConfig,
    max_workers: usize,
    workers: usize,
    error_metric: i64,
    backoff: u32,
}

impl Oversight {
    /// Creates the state for a pool of `initial` workers capped at `max`.
    #[must_use]
    pub fn new(config: OversightConfig, initial: usize, max: usize) -> Self {
        Self {
            config,
            max_workers: max,
            workers: initial.min(max),
            error_metric: 0,
            backoff: 0,
        }
    }

    fn threshold(&self) -> i64 {
        i64::from(self.config.hysteresis).saturating_mul(self.workers as i64)
    }

    /// Records one outcome and returns the resulting action.
    pub fn record(&mut self, outcome: CallOutcome) -> OversightAction {
        match outcome {
            CallOutcome::Other => OversightAction::Hold,
            CallOutcome::Success => {
                self.error_metric += 1;
                if self.error_metric < self.threshold() {
                    return OversightAction::Hold;
                }
                self.error_metric = 0;
                self.backoff = self.backoff.saturating_sub(1);
                if self.workers < self.max_workers {
                    self.workers += 1;
                    OversightAction::Grow
                } else {
                    OversightAction::Hold
                }
            }
            CallOutcome::Timeout => {
                if self.backoff >= self.config.backoff_cap {
                    return OversightAction::ClosePeer;
                }
                self.error_metric -= 1;
                if self.error_metric > -self.threshold() {
                    return OversightAction::Hold;
                }
                self.error_metric = 0;
                if self.workers == 0 {
                    return OversightAction::Hold;
                }
                self.workers -= 1;
                if self.workers > 0 {
                    return OversightAction::Shrink;
                }
                self.backoff = (self.backoff + 1).min(self.config.backoff_cap);
                OversightAction::ShrinkAndBackoff(self.config.backoff_step * self.backoff)
            }
        }
    }

    /// Restores one worker after a backoff sleep.
    pub fn restore_after_backoff(&mut self) {
        if self.workers < self.max_workers {
            self.workers += 1;
        }
    }

    /// Current worker count.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Current backoff level.
    #[must_use]
    pub const fn backoff_level(&self) -> u32 {
        self.backoff
    }

    /// Current error metric.
    #[must_use]
    pub const fn error_metric(&self) -> i64 {
        self.error_metric
    }
}

/// A request waiting in the shared queue.
#[derive(Debug)]
pub struct RequestItem {
    pub(crate) request: PeerRequest,
    pub(crate) reply: oneshot::Sender<Result<PeerResponse, CallError>>,
}

impl RequestItem {
    /// Wraps `request`; the receiver yields the answer of whichever peer
    /// serves it.
    #[must_use]
    pub fn new(request: PeerRequest) -> (Self, oneshot::Receiver<Result<PeerResponse, CallError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusSnapshot {
    /// Request workers in the pool.
    pub request_workers: usize,
    /// Backoff level.
    pub backoff_level: u32,
    /// Requests answered.
    pub completed: u64,
    /// Requests that timed out.
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct BusStats {
    request_workers: AtomicUsize,
    backoff_level: AtomicU32,
    completed: AtomicU64,
    timeouts: AtomicU64,
}

impl BusStats {
    fn publish(&self, oversight: &Oversight) {
        self.request_workers
            .store(oversight.workers(), Ordering::Relaxed);
        self.backoff_level
            .store(oversight.backoff_level(), Ordering::Relaxed);
    }
}

struct BusInner {
    caller: Arc<dyn PeerCaller>,
    requests: SharedQueue<RequestItem>,
    kill: SharedQueue<()>,
    metrics: mpsc::Sender<CallOutcome>,
    consensus: MsgQueue,
    transactions: MsgQueue,
    stats: BusStats,
    msg_timeout: Duration,
    closed: CancellationToken,
}

/// Dispatch bus bound to one peer. Cloning shares the bus.
#[derive(Clone)]
pub struct PeerBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for PeerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerBus")
            .field("peer", self.inner.caller.node_addr())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PeerBus {
    /// Starts the request workers, the oversight and both gossip queues.
    /// Everything stops when the caller's close signal fires.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(
        caller: Arc<dyn PeerCaller>,
        requests: SharedQueue<RequestItem>,
        config: &BusConfig,
        queue: &QueueConfig,
        key: DedupKey,
        msg_timeout: Duration,
    ) -> Self {
        let closed = caller.close_signal();
        let max_workers = config.max_request_workers.max(1);
        let (metrics, metric_rx) = mpsc::channel(max_workers);
        let consensus = MsgQueue::spawn(
            queue.capacity,
            config.gossip_workers,
            key.clone(),
            msg_timeout,
            closed.clone(),
        );
        let transactions = MsgQueue::spawn(
            queue.capacity,
            config.tx_gossip_workers,
            key,
            msg_timeout,
            closed.clone(),
        );
        let bus = Self {
            inner: Arc::new(BusInner {
                caller,
                requests,
                kill: SharedQueue::new(1),
                metrics,
                consensus,
                transactions,
                stats: BusStats::default(),
                msg_timeout,
                closed,
            }),
        };

        let oversight = Oversight::new(config.oversight, config.initial_request_workers, max_workers);
        bus.inner.stats.publish(&oversight);
        for _ in 0..oversight.workers() {
            bus.spawn_request_worker();
        }
        tokio::spawn(bus.clone().oversee(oversight, metric_rx));
        bus
    }

    fn spawn_request_worker(&self) {
        tokio::spawn(self.clone().request_worker());
    }

    async fn request_worker(self) {
        let inner = &self.inner;
        trace!(peer = %inner.caller.node_addr(), "Starting request worker");
        loop {
            let item = tokio::select! {
                biased;
                () = inner.closed.cancelled() => return,
                _ = inner.kill.pop() => {
                    trace!(peer = %inner.caller.node_addr(), "Stopping request worker");
                    return;
                }
                item = inner.requests.pop() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            self.dispatch(item).await;
        }
    }

    async fn dispatch(&self, item: RequestItem) {
        let inner = &self.inner;
        let RequestItem { request, reply } = item;
        let result = match tokio::time::timeout(inner.msg_timeout, inner.caller.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout),
        };
        let outcome = CallOutcome::of(&result);
        match outcome {
            CallOutcome::Success => inner.stats.completed.fetch_add(1, Ordering::Relaxed),
            CallOutcome::Timeout => inner.stats.timeouts.fetch_add(1, Ordering::Relaxed),
            CallOutcome::Other => 0,
        };
        let _ = reply.send(result);
        self.report(outcome).await;
    }

    async fn report(&self, outcome: CallOutcome) {
        tokio::select! {
            () = self.inner.closed.cancelled() => {}
            _ = self.inner.metrics.send(outcome) => {}
        }
    }

    async fn oversee(self, mut oversight: Oversight, mut metrics: mpsc::Receiver<CallOutcome>) {
        let inner = &self.inner;
        let peer = inner.caller.node_addr().clone();
        loop {
            let outcome = tokio::select! {
                () = inner.closed.cancelled() => return,
                outcome = metrics.recv() => match outcome {
                    Some(outcome) => outcome,
                    None => return,
                },
            };
            let action = oversight.record(outcome);
            inner.stats.publish(&oversight);
            match action {
                OversightAction::Hold => {}
                OversightAction::Grow => {
                    debug!(peer = %peer, workers = oversight.workers(), "Increasing request workers");
                    self.spawn_request_worker();
                }
                OversightAction::Shrink => {
                    debug!(peer = %peer, workers = oversight.workers(), "Decreasing request workers");
                    if !self.signal_kill().await {
                        return;
                    }
                }
                OversightAction::ShrinkAndBackoff(wait) => {
                    debug!(
                        peer = %peer,
                        backoff = oversight.backoff_level(),
                        wait_secs = wait.as_secs(),
                        "No request workers left; backing off"
                    );
                    if !self.signal_kill().await {
                        return;
                    }
                    tokio::select! {
                        () = inner.closed.cancelled() => return,
                        () = tokio::time::sleep(wait) => {}
                    }
                    oversight.restore_after_backoff();
                    inner.stats.publish(&oversight);
                    self.spawn_request_worker();
                }
                OversightAction::ClosePeer => {
                    warn!(peer = %peer, "Closing peer at maximum backoff");
                    inner.caller.close();
                }
            }
        }
    }

    async fn signal_kill(&self) -> bool {
        tokio::select! {
            () = self.inner.closed.cancelled() => false,
            pushed = self.inner.kill.push(()) => pushed,
        }
    }

    /// Injects `amount` outcomes into the oversight: successes if positive,
    /// timeouts if negative.
    ///
    /// Must be called within a Tokio runtime.
    pub fn feedback(&self, amount: i32) {
        if amount == 0 {
            return;
        }
        let outcome = if amount > 0 {
            CallOutcome::Success
        } else {
            CallOutcome::Timeout
        };
        let bus = self.clone();
        tokio::spawn(async move {
            for _ in 0..amount.unsigned_abs() {
                if bus.inner.closed.is_cancelled() {
                    return;
                }
                bus.report(outcome).await;
            }
        });
    }

    fn queue_for(&self, class: GossipClass) -> &MsgQueue {
        match class {
            GossipClass::Consensus => &self.inner.consensus,
            GossipClass::Transaction => &self.inner.transactions,
        }
    }

    /// Queues `message` for delivery to this peer unless it is already
    /// known. Returns true if queued.
    pub async fn gossip(&self, message: GossipMessage) -> bool {
        let body = message.dedup_input();
        let queue = self.queue_for(message.class()).clone();
        let caller = Arc::clone(&self.inner.caller);
        let timeout = self.inner.msg_timeout;
        let deliver: DeliverFn = Arc::new(move || -> BoxFuture<'static, Result<(), CallError>> {
            let caller = Arc::clone(&caller);
            let message = message.clone();
            Box::pin(async move {
                match tokio::time::timeout(timeout, caller.gossip(message)).await {
                    Ok(result) => result,
                    Err(_) => Err(CallError::Timeout),
                }
            })
        });
        queue.add(&body, deliver).await
    }

    /// Marks `message` as known so it is never sent back to this peer.
    pub fn prevent(&self, message: &GossipMessage) {
        self.queue_for(message.class())
            .prevent(&message.dedup_input());
    }

    /// Returns true if `message` is known to this peer's queue.
    #[must_use]
    pub fn knows(&self, message: &GossipMessage) -> bool {
        self.queue_for(message.class())
            .contains(&message.dedup_input())
    }

    /// The peer this bus serves.
    #[must_use]
    pub fn caller(&self) -> &Arc<dyn PeerCaller> {
        &self.inner.caller
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusSnapshot {
        let stats = &self.inner.stats;
        BusSnapshot {
            request_workers: stats.request_workers.load(Ordering::Relaxed),
            backoff_level: stats.backoff_level.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
