//! Direct access to one active peer.

use std::time::Duration;

use peerlink_transport::{NodeAddress, NodeIdentity};

use crate::active::ActiveEntry;
use crate::error::CallError;
use crate::message::{GossipMessage, PeerRequest, PeerResponse};
use crate::peer::{ActivePeer, PeerInfo};

/// A handle on one active peer, bypassing the shared request queue.
///
/// Calls made through a lease do not feed the peer's worker oversight; use
/// [`PeerLease::feedback`] to report on the peer's behaviour.
#[derive(Debug, Clone)]
pub struct PeerLease {
    peer: ActivePeer,
    msg_timeout: Duration,
}

impl PeerLease {
    pub(crate) const fn new(peer: ActivePeer, msg_timeout: Duration) -> Self {
        Self { peer, msg_timeout }
    }

    /// Address of the leased peer.
    #[must_use]
    pub fn node_addr(&self) -> &NodeAddress {
        self.peer.node_addr()
    }

    /// Identity of the leased peer.
    #[must_use]
    pub fn identity(&self) -> NodeIdentity {
        self.peer.identity()
    }

    /// Sends `request` to this peer and waits up to the message timeout.
    pub async fn call(&self, request: PeerRequest) -> Result<PeerResponse, CallError> {
        self.call_with_timeout(request, self.msg_timeout).await
    }

    /// Sends `request` to this peer and waits up to `timeout`.
    pub async fn call_with_timeout(
        &self,
        request: PeerRequest,
        timeout: Duration,
    ) -> Result<PeerResponse, CallError> {
        if self.peer.is_closed() {
            return Err(CallError::Closed);
        }
        tokio::time::timeout(timeout, self.peer.bus().caller().call(request))
            .await
            .unwrap_or(Err(CallError::Timeout))
    }

    /// Sends `message` to this peer and waits for its acknowledgement. The
    /// message is marked known in the peer's queue first so it is not also
    /// delivered through broadcast.
    pub async fn gossip(&self, message: GossipMessage) -> Result<(), CallError> {
        if self.peer.is_closed() {
            return Err(CallError::Closed);
        }
        self.peer.bus().prevent(&message);
        tokio::time::timeout(self.msg_timeout, self.peer.bus().caller().gossip(message))
            .await
            .unwrap_or(Err(CallError::Timeout))
    }

    /// Reports `amount` successes (positive) or timeouts (negative) to the
    /// peer's worker oversight.
    ///
    /// Must be called within a Tokio runtime.
    pub fn feedback(&self, amount: i32) {
        self.peer.bus().feedback(amount);
    }

    /// Closes the connection to this peer.
    pub fn close(&self) {
        self.peer.close();
    }

    /// Returns true once the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }

    /// Snapshot of the leased peer.
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        self.peer.info()
    }
}
