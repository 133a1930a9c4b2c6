//! Dialing and accepting secure peer connections.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::NodeAddress;
use crate::channel::{SecureChannel, SecureReader, SecureWriter};
use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::handshake::initiate;
use crate::identity::{NodeIdentity, StaticKey};
use crate::listener::{AcceptEvent, Listener};
use crate::negotiate::{LocalParams, Negotiated, negotiate_outbound};
use crate::types::{Initiator, Protocol};

/// An authenticated, negotiated connection to a peer.
#[derive(Debug)]
pub struct P2pConn {
    channel: SecureChannel,
    local: NodeAddress,
    remote: NodeAddress,
    initiator: Initiator,
    negotiated: Negotiated,
}

impl P2pConn {
    pub(crate) fn new(
        channel: SecureChannel,
        local: NodeAddress,
        remote: NodeAddress,
        initiator: Initiator,
        negotiated: Negotiated,
    ) -> Self {
        Self {
            channel,
            local,
            remote,
            initiator,
            negotiated,
        }
    }

    /// Address of this node as seen on this connection.
    #[must_use]
    pub const fn local_addr(&self) -> &NodeAddress {
        &self.local
    }

    /// Address of the remote node. The port is its advertised listening port.
    #[must_use]
    pub const fn remote_addr(&self) -> &NodeAddress {
        &self.remote
    }

    /// Authenticated identity of the remote node.
    #[must_use]
    pub const fn remote_identity(&self) -> NodeIdentity {
        self.remote.identity()
    }

    /// Which side dialed.
    #[must_use]
    pub const fn initiator(&self) -> Initiator {
        self.initiator
    }

    /// Negotiated sub-protocol.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.negotiated.protocol
    }

    /// Negotiated protocol version.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.negotiated.version
    }

    /// Reads one message.
    pub async fn read_message(&mut self) -> TransportResult<Vec<u8>> {
        self.channel.read_message().await
    }

    /// Writes one message.
    pub async fn write_message(&mut self, msg: &[u8]) -> TransportResult<()> {
        self.channel.write_message(msg).await
    }

    /// Close signal shared with the underlying channel.
    #[must_use]
    pub fn close_signal(&self) -> CancellationToken {
        self.channel.close_signal()
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Splits into the channel halves and the close signal.
    pub fn into_parts(self) -> (SecureReader, SecureWriter, CancellationToken) {
        let signal = self.channel.close_signal();
        let (reader, writer) = self.channel.into_split();
        (reader, writer, signal)
    }
}

/// Binds a listener and dials peers with one static key.
#[derive(Debug)]
pub struct P2pTransport {
    config: TransportConfig,
    key: StaticKey,
    listener: Listener,
    local: NodeAddress,
}

impl P2pTransport {
    /// Binds the listening socket and starts accepting.
    pub async fn bind(config: TransportConfig, key: StaticKey) -> TransportResult<Self> {
        let listener = Listener::bind(config.clone(), key.clone()).await?;
        let port = listener.local_addr().port();
        let local = NodeAddress::new(config.chain_id, key.identity(), config.host.clone(), port);
        info!(addr = %local, "Transport ready");
        Ok(Self {
            config,
            key,
            listener,
            local,
        })
    }

    /// This node's advertised address.
    #[must_use]
    pub const fn node_addr(&self) -> &NodeAddress {
        &self.local
    }

    /// Bound socket address.
    #[must_use]
    pub const fn local_socket(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Admission counters of the listener.
    #[must_use]
    pub const fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Waits for the next inbound connection, skipping rejected attempts.
    pub async fn accept(&self) -> TransportResult<P2pConn> {
        loop {
            match self.listener.next_event().await? {
                AcceptEvent::Accepted(conn) => return Ok(conn),
                AcceptEvent::Rejected { remote } => {
                    debug!(remote = %remote, "Skipping rejected connection");
                }
            }
        }
    }

    /// Waits for the next accept event, including rejections.
    pub async fn accept_event(&self) -> TransportResult<AcceptEvent> {
        self.listener.next_event().await
    }

    /// Dials `addr` and negotiates `protocol`.
    pub async fn dial(&self, addr: &NodeAddress, protocol: Protocol) -> TransportResult<P2pConn> {
        if self.listener.is_closed() {
            return Err(TransportError::Closed);
        }
        let host_port = addr.host_port();
        let mut stream = tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(host_port.as_str()),
        )
        .await
        .map_err(|_| TransportError::DialTimeout(host_port.clone()))??;
        let _ = stream.set_nodelay(true);

        let deadline = self.config.handshake_timeout;
        let keys = initiate(&mut stream, self.key.clone(), addr.identity(), deadline).await?;
        if keys.remote != addr.identity() {
            return Err(TransportError::IdentityMismatch);
        }

        let mut channel = SecureChannel::new(Box::new(stream), keys);
        let params = LocalParams {
            chain_id: self.config.chain_id,
            port: self.local.port(),
            version: self.config.protocol_version,
        };
        let negotiated = negotiate_outbound(&mut channel, &params, protocol, deadline).await?;

        debug!(peer = %addr, protocol = %protocol, "Dialed peer");
        Ok(P2pConn::new(
            channel,
            self.local.clone(),
            addr.clone(),
            Initiator::SelfInitiated,
            negotiated,
        ))
    }

    /// Stops the listener. Idempotent.
    pub fn close(&self) {
        self.listener.close();
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.listener.is_closed()
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
