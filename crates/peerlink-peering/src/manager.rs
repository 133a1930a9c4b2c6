//! The peer manager: accepts and dials connections, keeps the peer
//! directory, and runs the gossip fan-out and discovery loops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use peerlink_transport::{
    AcceptEvent, Multiplexer, NodeAddress, NodeIdentity, P2pConn, P2pTransport, Protocol,
    StaticKey,
};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::active::{ActiveEntry, ActivePeerStore};
use crate::bootnode::{self, DiscoveryRequest, DiscoveryResponse};
use crate::bus::{PeerBus, RequestItem};
use crate::caller::{BoxFuture, PeerCaller};
use crate::client::PeerClient;
use crate::config::PeeringConfig;
use crate::discovery;
use crate::error::{HandlerError, PeeringError, PeeringResult};
use crate::handler::RequestHandler;
use crate::inactive::InactivePeerStore;
use crate::lease::PeerLease;
use crate::message::{GetPeersResponse, GossipMessage, PeerRequest, PeerResponse};
use crate::msgq::DedupKey;
use crate::peer::{ActivePeer, PeerInfo};
use crate::queue::SharedQueue;
use crate::rpc::{self, RpcClient};

#[cfg(feature = "upnp")]
const UPNP_LEASE: std::time::Duration = std::time::Duration::from_secs(20 * 60);

/// Active and inactive peer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerCounts {
    /// Peers with a live connection.
    pub active: usize,
    /// Known peers waiting to be dialed.
    pub inactive: usize,
}

/// Peer limits and counts, printed as `max/active/min/inactive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    /// Maximum active peers.
    pub max: usize,
    /// Current active peers.
    pub active: usize,
    /// Minimum active peers for peering to be complete.
    pub min: usize,
    /// Current inactive peers.
    pub inactive: usize,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.max, self.active, self.min, self.inactive)
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: PeeringConfig,
    pub(crate) transport: Arc<P2pTransport>,
    multiplexer: Multiplexer,
    handler: Arc<dyn RequestHandler>,
    pub(crate) active: ActivePeerStore<ActivePeer>,
    pub(crate) inactive: InactivePeerStore,
    /// Serializes directory changes made by the discovery loops and by
    /// connection setup.
    pub(crate) discovery_lock: AsyncMutex<()>,
    requests: SharedQueue<RequestItem>,
    consensus_gossip: SharedQueue<GossipMessage>,
    tx_gossip: SharedQueue<GossipMessage>,
    dedup_key: DedupKey,
    pub(crate) peering_complete: AtomicBool,
    started: AtomicBool,
    pub(crate) tasks: TaskTracker,
    pub(crate) closed: CancellationToken,
}

impl ManagerInner {
    pub(crate) fn identity(&self) -> NodeIdentity {
        self.transport.node_addr().identity()
    }

    /// True if `addr` is worth keeping as a peer: same chain, not this
    /// node, not already active.
    pub(crate) fn is_candidate(&self, addr: &NodeAddress) -> bool {
        addr.chain_id() == self.transport.node_addr().chain_id()
            && addr.identity() != self.identity()
            && !self.active.contains(&addr.identity())
    }

    pub(crate) fn status(&self) -> PeerStatus {
        PeerStatus {
            max: self.config.peer_limit_max,
            active: self.active.len(),
            min: self.config.peer_limit_min,
            inactive: self.inactive.len(),
        }
    }

    /// One random active and one random inactive peer, never `requester`.
    /// Empty in firewall mode.
    pub(crate) fn get_peers(&self, requester: &NodeIdentity) -> Vec<NodeAddress> {
        if self.config.firewall_mode {
            return Vec::new();
        }
        let mut peers = Vec::with_capacity(2);
        if let Some(peer) = self.active.random_except(requester) {
            peers.push(peer.node_addr().clone());
        }
        if let Some(addr) = self.inactive.random_except(requester) {
            if !peers.contains(&addr) {
                peers.push(addr);
            }
        }
        peers
    }

    /// Dials `addr` on the peer protocol and brings the connection up.
    pub(crate) async fn connect(self: &Arc<Self>, addr: &NodeAddress) -> PeeringResult<()> {
        if self.closed.is_cancelled() {
            return Err(PeeringError::Closed);
        }
        if addr.identity() == self.identity() {
            return Err(PeeringError::Protocol("refusing to dial self".into()));
        }
        if self.active.contains(&addr.identity()) {
            return Ok(());
        }
        let conn = self.transport.dial(addr, Protocol::P2p).await?;
        self.handle_p2p(conn).await
    }

    /// Multiplexes `conn`, wires its RPC streams to a new bus and stores it
    /// as active.
    async fn handle_p2p(self: &Arc<Self>, conn: P2pConn) -> PeeringResult<()> {
        let remote = conn.remote_addr().clone();
        if remote.identity() == self.identity() {
            conn.close();
            return Err(PeeringError::Protocol("connection to self".into()));
        }

        let (handle, client_stream, server_stream) =
            self.multiplexer.handle_connection(conn).await?.into_parts();
        let closed = handle.close_signal();
        let client = RpcClient::spawn(client_stream, remote.clone(), closed.clone());
        let bus = PeerBus::spawn(
            Arc::new(client) as Arc<dyn PeerCaller>,
            self.requests.clone(),
            &self.config.bus,
            &self.config.queue,
            self.dedup_key.clone(),
            self.config.msg_timeout,
        );
        let router = InboundRouter {
            manager: Arc::downgrade(self),
            bus: bus.clone(),
            handler: Arc::clone(&self.handler),
        };
        rpc::serve(
            server_stream,
            remote.clone(),
            Arc::new(router),
            closed,
            self.config.bus.max_request_workers,
        );

        let peer = ActivePeer::new(handle, bus);
        let added = {
            let _guard = self.discovery_lock.lock().await;
            let added = self.active.add(peer);
            if added {
                self.inactive.del(&remote);
            }
            added
        };
        if added {
            debug!(peer = %remote, active = self.active.len(), "Peer connected");
        } else {
            debug!(peer = %remote, "Dropping duplicate connection");
        }
        Ok(())
    }

    /// Answers one `GetPeers` query within the message timeout, records the
    /// dialer as inactive, and closes after the linger period. A dialer that
    /// fails the exchange is closed at once.
    async fn serve_discovery(self: Arc<Self>, mut conn: P2pConn) {
        let remote = conn.remote_addr().clone();
        let served = tokio::select! {
            () = self.closed.cancelled() => Err(PeeringError::Closed),
            served = bootnode::serve_request(&mut conn, self.config.msg_timeout, |request| {
                match request {
                    DiscoveryRequest::GetPeers => {
                        DiscoveryResponse::from_addrs(&self.get_peers(&remote.identity()))
                    }
                    DiscoveryRequest::KnownNodes => DiscoveryResponse::default(),
                }
            }) => served,
        };
        if let Err(e) = served {
            debug!(peer = %remote, error = %e, "Discovery request failed");
            conn.close();
            return;
        }
        if self.is_candidate(&remote) {
            let _guard = self.discovery_lock.lock().await;
            self.inactive.add(remote.clone());
        }
        tokio::select! {
            () = self.closed.cancelled() => {}
            () = tokio::time::sleep(self.config.discovery_linger) => {}
        }
        conn.close();
    }

    fn route(self: &Arc<Self>, conn: P2pConn) {
        match conn.protocol() {
            Protocol::P2p => {
                let manager = Arc::clone(self);
                self.tasks.spawn(async move {
                    let remote = conn.remote_addr().clone();
                    if let Err(e) = manager.handle_p2p(conn).await {
                        debug!(peer = %remote, error = %e, "Inbound peer setup failed");
                    }
                });
            }
            Protocol::Discovery => {
                self.tasks.spawn(Arc::clone(self).serve_discovery(conn));
            }
            Protocol::Bootnode => {
                debug!(peer = %conn.remote_addr(), "Closing unserved bootnode connection");
                conn.close();
            }
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            let event = tokio::select! {
                () = self.closed.cancelled() => return,
                event = self.transport.accept_event() => event,
            };
            match event {
                Ok(AcceptEvent::Accepted(conn)) => self.route(conn),
                Ok(AcceptEvent::Rejected { remote }) => {
                    debug!(remote = %remote, "Skipping rejected connection");
                }
                Err(e) => {
                    if !self.closed.is_cancelled() {
                        warn!(error = %e, "Accept loop stopped; closing peer manager");
                        self.close();
                    }
                    return;
                }
            }
        }
    }

    /// Hands every message from `queue` to each active peer's bus.
    async fn gossip_loop(self: Arc<Self>, queue: SharedQueue<GossipMessage>) {
        loop {
            let message = tokio::select! {
                () = self.closed.cancelled() => return,
                message = queue.pop() => match message {
                    Some(message) => message,
                    None => return,
                },
            };
            let peers = self.active.entries();
            trace!(kind = message.kind(), peers = peers.len(), "Broadcasting gossip");
            for peer in peers {
                if self.closed.is_cancelled() {
                    return;
                }
                peer.bus().gossip(message.clone()).await;
            }
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.transport.close();
        self.active.close();
        self.inactive.close();
        self.tasks.close();
        info!(addr = %self.transport.node_addr(), "Peer manager closed");
    }
}

/// Serves one peer's inbound traffic: `GetPeers` is answered from the
/// directory, everything else goes to the application handler. Gossip
/// received from the peer is marked known so it is not echoed back.
struct InboundRouter {
    manager: Weak<ManagerInner>,
    bus: PeerBus,
    handler: Arc<dyn RequestHandler>,
}

impl RequestHandler for InboundRouter {
    fn handle_request<'a>(
        &'a self,
        from: &'a NodeAddress,
        request: PeerRequest,
    ) -> BoxFuture<'a, Result<PeerResponse, HandlerError>> {
        if matches!(request, PeerRequest::GetPeers) {
            let result = match self.manager.upgrade() {
                Some(manager) => Ok(PeerResponse::GetPeers(GetPeersResponse {
                    peers: manager
                        .get_peers(&from.identity())
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                })),
                None => Err(HandlerError::Unavailable("peer manager closed".into())),
            };
            return Box::pin(async move { result });
        }
        self.handler.handle_request(from, request)
    }

    fn handle_gossip<'a>(
        &'a self,
        from: &'a NodeAddress,
        message: GossipMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.bus.prevent(&message);
        self.handler.handle_gossip(from, message)
    }
}

/// Owns the transport and every peer connection. Cloning shares the
/// manager.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerManager")
            .field("addr", self.inner.transport.node_addr())
            .field("status", &self.inner.status())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl PeerManager {
    /// Validates `config` and binds the listener. Nothing is accepted or
    /// dialed until [`PeerManager::start`].
    pub async fn bind(
        config: PeeringConfig,
        key: StaticKey,
        handler: Arc<dyn RequestHandler>,
    ) -> PeeringResult<Self> {
        config.validate()?;
        let transport = P2pTransport::bind(config.effective_transport(), key).await?;
        let multiplexer = Multiplexer::new(config.mux_bind_timeout);
        let inner = ManagerInner {
            transport: Arc::new(transport),
            multiplexer,
            handler,
            active: ActivePeerStore::new(true),
            inactive: InactivePeerStore::new(),
            discovery_lock: AsyncMutex::new(()),
            requests: SharedQueue::new(config.request_backlog()),
            consensus_gossip: SharedQueue::new(config.gossip_backlog()),
            tx_gossip: SharedQueue::new(config.tx_gossip_backlog()),
            dedup_key: DedupKey::generate(),
            peering_complete: AtomicBool::new(false),
            started: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            closed: CancellationToken::new(),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Starts accepting, the gossip fan-out and the discovery loops.
    /// Idempotent.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.closed.is_cancelled() || inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.tasks.spawn(Arc::clone(inner).accept_loop());
        inner
            .tasks
            .spawn(Arc::clone(inner).gossip_loop(inner.consensus_gossip.clone()));
        inner
            .tasks
            .spawn(Arc::clone(inner).gossip_loop(inner.tx_gossip.clone()));
        discovery::spawn_loops(inner);
        self.start_port_mapping();
        info!(
            addr = %inner.transport.node_addr(),
            min = inner.config.peer_limit_min,
            max = inner.config.peer_limit_max,
            firewall = inner.config.firewall_mode,
            "Peer manager started"
        );
    }

    #[cfg(feature = "upnp")]
    fn start_port_mapping(&self) {
        if !self.inner.config.upnp {
            return;
        }
        let port = self.inner.transport.node_addr().port();
        let closed = self.inner.closed.clone();
        self.inner.tasks.spawn(async move {
            match peerlink_transport::PortMapping::create(port, UPNP_LEASE).await {
                Ok(mapping) => mapping.maintain(closed).await,
                Err(e) => warn!(port, error = %e, "UPnP port mapping unavailable"),
            }
        });
    }

    #[cfg(not(feature = "upnp"))]
    fn start_port_mapping(&self) {
        if self.inner.config.upnp {
            warn!("UPnP requested but the upnp feature is disabled");
        }
    }

    /// This node's address.
    #[must_use]
    pub fn node_addr(&self) -> &NodeAddress {
        self.inner.transport.node_addr()
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<P2pTransport> {
        &self.inner.transport
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &PeeringConfig {
        &self.inner.config
    }

    /// Dials `addr` and adds it as an active peer. Succeeds without dialing
    /// if the peer is already active.
    pub async fn connect(&self, addr: &NodeAddress) -> PeeringResult<()> {
        self.inner.connect(addr).await
    }

    /// Records `addr` as a dial candidate. Returns false for this node,
    /// other chains, active peers, and identities cooling down.
    pub fn add_known_peer(&self, addr: NodeAddress) -> bool {
        self.inner.is_candidate(&addr) && self.inner.inactive.add(addr)
    }

    /// Load-balanced client over all active peers.
    #[must_use]
    pub fn client(&self) -> PeerClient {
        PeerClient::new(
            self.inner.requests.clone(),
            self.inner.consensus_gossip.clone(),
            self.inner.tx_gossip.clone(),
            self.inner.closed.clone(),
        )
    }

    /// Lease on the active peer with `identity`.
    #[must_use]
    pub fn lease(&self, identity: &NodeIdentity) -> Option<PeerLease> {
        self.inner
            .active
            .get(identity)
            .map(|peer| PeerLease::new(peer, self.inner.config.msg_timeout))
    }

    /// Lease on a random active peer.
    #[must_use]
    pub fn random_lease(&self) -> Option<PeerLease> {
        self.inner
            .active
            .random()
            .map(|peer| PeerLease::new(peer, self.inner.config.msg_timeout))
    }

    /// Snapshots of every active peer.
    #[must_use]
    pub fn active_peers(&self) -> Vec<PeerInfo> {
        self.inner
            .active
            .entries()
            .iter()
            .map(ActivePeer::info)
            .collect()
    }

    /// Active and inactive counts.
    #[must_use]
    pub fn counts(&self) -> PeerCounts {
        PeerCounts {
            active: self.inner.active.len(),
            inactive: self.inner.inactive.len(),
        }
    }

    /// Limits and counts.
    #[must_use]
    pub fn status(&self) -> PeerStatus {
        self.inner.status()
    }

    /// True once at least `peer_limit_min` peers were active at the last
    /// status check.
    #[must_use]
    pub fn peering_complete(&self) -> bool {
        self.inner.peering_complete.load(Ordering::Acquire)
    }

    /// The sample this node would give `requester` in answer to
    /// `GetPeers`.
    #[must_use]
    pub fn get_peers(&self, requester: &NodeIdentity) -> Vec<NodeAddress> {
        self.inner.get_peers(requester)
    }

    /// Shuts down the transport, every peer connection and every loop.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Resolves once the manager is closed and its tasks have finished.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
        self.inner.tasks.wait().await;
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
