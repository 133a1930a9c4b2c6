//! A connected peer as kept in the active store.

use chrono::{DateTime, Utc};
use peerlink_transport::{MuxHandle, NodeAddress, NodeIdentity};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::active::ActiveEntry;
use crate::bus::{BusSnapshot, PeerBus};

/// A multiplexed connection together with its dispatch bus.
#[derive(Debug, Clone)]
pub struct ActivePeer {
    handle: MuxHandle,
    bus: PeerBus,
    connected_at: DateTime<Utc>,
}

impl ActivePeer {
    /// Pairs a connection with the bus serving it.
    #[must_use]
    pub fn new(handle: MuxHandle, bus: PeerBus) -> Self {
        Self {
            handle,
            bus,
            connected_at: Utc::now(),
        }
    }

    /// The peer's dispatch bus.
    #[must_use]
    pub const fn bus(&self) -> &PeerBus {
        &self.bus
    }

    /// Connection lifetime handle.
    #[must_use]
    pub const fn handle(&self) -> &MuxHandle {
        &self.handle
    }

    /// When the connection was added.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        let addr = self.handle.remote_addr();
        PeerInfo {
            address: addr.to_string(),
            identity: addr.identity().short(),
            outbound: self.handle.initiator().is_self(),
            connected_at: self.connected_at,
            bus: self.bus.stats(),
        }
    }
}

impl ActiveEntry for ActivePeer {
    fn identity(&self) -> NodeIdentity {
        self.handle.remote_addr().identity()
    }

    fn node_addr(&self) -> &NodeAddress {
        self.handle.remote_addr()
    }

    fn close_signal(&self) -> CancellationToken {
        self.handle.close_signal()
    }

    fn close(&self) {
        self.handle.close();
    }
}

/// Serializable view of one active peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    /// Full peer address.
    pub address: String,
    /// Abbreviated identity.
    pub identity: String,
    /// True if this node dialed.
    pub outbound: bool,
    /// When the connection was added.
    pub connected_at: DateTime<Utc>,
    /// Bus counters.
    pub bus: BusSnapshot,
}
