//! One-shot discovery exchanges.
//!
//! A discovery exchange is a single JSON request and a single JSON response
//! on a fresh [`P2pConn`]. Boot nodes answer [`DiscoveryRequest::KnownNodes`]
//! on the `Bootnode` sub-protocol; peers answer
//! [`DiscoveryRequest::GetPeers`] on the `Discovery` sub-protocol.

use std::sync::Arc;
use std::time::Duration;

use peerlink_transport::{NodeAddress, P2pConn, P2pTransport, Protocol};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::{CallError, PeeringError, PeeringResult};

/// Request sent on a discovery connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryRequest {
    /// All nodes a boot node knows about.
    KnownNodes,
    /// A small sample of the peer's active and inactive peers.
    GetPeers,
}

/// Response to a [`DiscoveryRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    /// Peer addresses in `NodeAddress` string form.
    pub peers: Vec<String>,
}

impl DiscoveryResponse {
    /// Builds a response from addresses.
    #[must_use]
    pub fn from_addrs<'a>(addrs: impl IntoIterator<Item = &'a NodeAddress>) -> Self {
        Self {
            peers: addrs.into_iter().map(ToString::to_string).collect(),
        }
    }

    /// Parses the listed addresses, skipping malformed entries.
    #[must_use]
    pub fn addrs(&self) -> Vec<NodeAddress> {
        self.peers
            .iter()
            .filter_map(|raw| match raw.parse::<NodeAddress>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    debug!(entry = %raw, error = %e, "Skipping malformed peer address");
                    None
                }
            })
            .collect()
    }
}

/// Asks the boot node at `addr` for the nodes it knows.
pub async fn query_known_nodes(
    transport: &P2pTransport,
    addr: &NodeAddress,
    timeout: Duration,
) -> PeeringResult<Vec<NodeAddress>> {
    query(transport, addr, Protocol::Bootnode, DiscoveryRequest::KnownNodes, timeout).await
}

/// Asks the peer at `addr` for a sample of its peers without opening a
/// peer session.
pub async fn query_peers(
    transport: &P2pTransport,
    addr: &NodeAddress,
    timeout: Duration,
) -> PeeringResult<Vec<NodeAddress>> {
    query(transport, addr, Protocol::Discovery, DiscoveryRequest::GetPeers, timeout).await
}

async fn query(
    transport: &P2pTransport,
    addr: &NodeAddress,
    protocol: Protocol,
    request: DiscoveryRequest,
    timeout: Duration,
) -> PeeringResult<Vec<NodeAddress>> {
    let attempt = async {
        let mut conn = transport.dial(addr, protocol).await?;
        let result = exchange(&mut conn, request).await;
        conn.close();
        result
    };
    let response = tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| PeeringError::Call(CallError::Timeout))??;
    let addrs = response.addrs();
    debug!(peer = %addr, protocol = %protocol, found = addrs.len(), "Discovery query answered");
    Ok(addrs)
}

async fn exchange(conn: &mut P2pConn, request: DiscoveryRequest) -> PeeringResult<DiscoveryResponse> {
    let body = serde_json::to_vec(&request).map_err(|e| PeeringError::Protocol(e.to_string()))?;
    conn.write_message(&body).await?;
    let raw = conn.read_message().await?;
    serde_json::from_slice(&raw).map_err(|e| PeeringError::Protocol(e.to_string()))
}

/// Reads one request from `conn` and writes the response `answer` builds.
/// The whole exchange must finish within `timeout`.
pub async fn serve_request<F>(
    conn: &mut P2pConn,
    timeout: Duration,
    answer: F,
) -> PeeringResult<DiscoveryRequest>
where
    F: FnOnce(DiscoveryRequest) -> DiscoveryResponse,
{
    let exchange = async {
        let raw = conn.read_message().await?;
        let request: DiscoveryRequest =
            serde_json::from_slice(&raw).map_err(|e| PeeringError::Protocol(e.to_string()))?;
        let response = answer(request);
        let body =
            serde_json::to_vec(&response).map_err(|e| PeeringError::Protocol(e.to_string()))?;
        conn.write_message(&body).await?;
        Ok(request)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| PeeringError::Call(CallError::Timeout))?
}

/// Runs a boot node: answers every `KnownNodes` request on `transport`
/// with `known` until `closed` fires. The transport must serve the
/// `Bootnode` sub-protocol. A dialer that does not finish its exchange
/// within `timeout` is disconnected. Returns once every in-flight exchange
/// has ended.
pub async fn serve_known_nodes(
    transport: Arc<P2pTransport>,
    known: Vec<NodeAddress>,
    timeout: Duration,
    closed: CancellationToken,
) {
    let known = Arc::new(known);
    let tasks = TaskTracker::new();
    info!(addr = %transport.node_addr(), known = known.len(), "Boot node serving");
    loop {
        let conn = tokio::select! {
            () = closed.cancelled() => break,
            conn = transport.accept() => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "Boot node stopped accepting");
                    break;
                }
            },
        };
        if conn.protocol() != Protocol::Bootnode {
            debug!(peer = %conn.remote_addr(), protocol = %conn.protocol(), "Boot node ignoring connection");
            conn.close();
            continue;
        }
        let known = Arc::clone(&known);
        let closed = closed.clone();
        tasks.spawn(async move {
            let mut conn = conn;
            let served = tokio::select! {
                () = closed.cancelled() => Err(PeeringError::Closed),
                served = serve_request(&mut conn, timeout, |request| match request {
                    DiscoveryRequest::KnownNodes => DiscoveryResponse::from_addrs(known.iter()),
                    DiscoveryRequest::GetPeers => DiscoveryResponse::default(),
                }) => served,
            };
            if let Err(e) = served {
                debug!(peer = %conn.remote_addr(), error = %e, "Boot node request failed");
            }
            conn.close();
        });
    }
    tasks.close();
    tasks.wait().await;
}
