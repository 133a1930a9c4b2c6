//! Periodic discovery and maintenance loops of the peer manager.
//!
//! Each loop runs one step per interval until the manager closes. A step
//! failing with a fatal error closes the whole manager.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use peerlink_transport::NodeAddress;
use rand::seq::SliceRandom;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::active::ActiveEntry;
use crate::bootnode;
use crate::bus::CallOutcome;
use crate::error::{CallError, PeeringError, PeeringResult};
use crate::manager::ManagerInner;
use crate::message::{PeerRequest, PeerResponse};

pub(crate) fn spawn_loops(manager: &Arc<ManagerInner>) {
    let intervals = manager.config.intervals;
    spawn_loop(manager, "dial_inactive", intervals.dial_inactive, ManagerInner::dial_inactive);
    spawn_loop(manager, "get_peers", intervals.get_peers, ManagerInner::get_peers_from_active);
    if manager.config.firewall_mode {
        spawn_loop(manager, "dial_firewall", intervals.firewall, ManagerInner::dial_firewall);
    }
    if !manager.config.boot_nodes.is_empty() {
        spawn_loop(manager, "dial_bootnode", intervals.bootnode, ManagerInner::dial_bootnode);
    }
    spawn_loop(manager, "peer_status", intervals.status, ManagerInner::peer_status);
}

fn spawn_loop<F, Fut>(manager: &Arc<ManagerInner>, name: &'static str, period: Duration, step: F)
where
    F: Fn(Arc<ManagerInner>) -> Fut + Send + 'static,
    Fut: Future<Output = PeeringResult<()>> + Send + 'static,
{
    let manager = Arc::clone(manager);
    let tasks = manager.tasks.clone();
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = manager.closed.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match step(Arc::clone(&manager)).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    warn!(task = name, error = %e, "Discovery loop failed; closing peer manager");
                    manager.close();
                    break;
                }
                Err(e) => debug!(task = name, error = %e, "Discovery step failed"),
            }
        }
        trace!(task = name, "Discovery loop stopped");
    });
}

impl ManagerInner {
    fn below_max(&self) -> bool {
        self.active.len() < self.config.peer_limit_max
    }

    /// Maps a failed dial to a fatal error only if the transport itself is
    /// gone.
    fn dial_failure(&self, e: PeeringError) -> PeeringResult<()> {
        if self.transport.is_closed() || self.closed.is_cancelled() {
            return Err(PeeringError::Closed);
        }
        Err(e)
    }

    /// Dials one random inactive peer.
    pub(crate) async fn dial_inactive(self: Arc<Self>) -> PeeringResult<()> {
        let addr = {
            let _guard = self.discovery_lock.lock().await;
            if !self.below_max() {
                return Ok(());
            }
            match self.inactive.random_pop() {
                Some(addr) if self.is_candidate(&addr) => addr,
                _ => return Ok(()),
            }
        };
        debug!(peer = %addr, "Dialing inactive peer");
        match self.connect(&addr).await {
            Ok(()) => Ok(()),
            Err(e) => self.dial_failure(e),
        }
    }

    /// Asks a random active peer for its peers and records the new ones as
    /// inactive.
    pub(crate) async fn get_peers_from_active(self: Arc<Self>) -> PeeringResult<()> {
        if self.active.is_empty() || !self.below_max() {
            return Ok(());
        }
        let Some(peer) = self.active.random() else {
            return Ok(());
        };
        let call = peer.bus().caller().call(PeerRequest::GetPeers);
        let result = tokio::time::timeout(self.config.msg_timeout, call)
            .await
            .unwrap_or(Err(CallError::Timeout));
        match CallOutcome::of(&result) {
            CallOutcome::Success => peer.bus().feedback(1),
            CallOutcome::Timeout => peer.bus().feedback(-1),
            CallOutcome::Other => {}
        }
        let peers = match result? {
            PeerResponse::GetPeers(response) => response.peers,
            other => {
                return Err(PeeringError::Protocol(format!(
                    "get_peers answered with {}",
                    other.method()
                )));
            }
        };

        let _guard = self.discovery_lock.lock().await;
        let mut added = 0usize;
        for raw in peers {
            let Ok(addr) = raw.parse::<NodeAddress>() else {
                debug!(peer = %peer.node_addr(), entry = %raw, "Skipping malformed peer address");
                continue;
            };
            if self.is_candidate(&addr) && self.inactive.add(addr) {
                added += 1;
            }
        }
        trace!(peer = %peer.node_addr(), added, "Pulled peers from active peer");
        Ok(())
    }

    /// Keeps the firewall relay connected.
    pub(crate) async fn dial_firewall(self: Arc<Self>) -> PeeringResult<()> {
        let Some(host) = self.config.firewall_host.clone() else {
            return Ok(());
        };
        if self.active.contains(&host.identity()) {
            return Ok(());
        }
        debug!(peer = %host, "Dialing firewall host");
        match self.connect(&host).await {
            Ok(()) => Ok(()),
            Err(e) => self.dial_failure(e),
        }
    }

    /// Seeds the inactive store from a random boot node when this node has
    /// nothing left to dial.
    pub(crate) async fn dial_bootnode(self: Arc<Self>) -> PeeringResult<()> {
        if !self.below_max() || !self.inactive.is_empty() {
            return Ok(());
        }
        let node = {
            let mut rng = rand::thread_rng();
            self.config.boot_nodes.choose(&mut rng).cloned()
        };
        let Some(node) = node else {
            return Ok(());
        };
        debug!(peer = %node, "Querying boot node");
        let timeout = self.config.bootnode_timeout;
        let found = match bootnode::query_known_nodes(&self.transport, &node, timeout).await {
            Ok(found) => found,
            Err(e) => return self.dial_failure(e),
        };

        let _guard = self.discovery_lock.lock().await;
        let mut added = 0usize;
        for addr in found {
            if self.is_candidate(&addr) && self.inactive.add(addr) {
                added += 1;
            }
        }
        debug!(peer = %node, added, "Boot node answered");
        Ok(())
    }

    /// Recomputes whether peering is complete.
    pub(crate) async fn peer_status(self: Arc<Self>) -> PeeringResult<()> {
        let status = self.status();
        let complete = status.active >= self.config.peer_limit_min;
        let was = self.peering_complete.swap(complete, Ordering::AcqRel);
        if was != complete {
            info!(status = %status, complete, "Peering status changed");
        } else {
            trace!(status = %status, "Peering status");
        }
        Ok(())
    }
}
