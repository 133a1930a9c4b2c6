//! The outbound side of one peer connection.

use std::future::Future;
use std::pin::Pin;

use peerlink_transport::NodeAddress;
use tokio_util::sync::CancellationToken;

use crate::error::CallError;
use crate::message::{GossipMessage, PeerRequest, PeerResponse};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Issues remote operations against one connected peer.
///
/// Implemented by the RPC client bound to a multiplexed connection. Timeouts
/// are applied by callers, not by implementations.
pub trait PeerCaller: Send + Sync + 'static {
    /// Address of the remote peer.
    fn node_addr(&self) -> &NodeAddress;

    /// Sends a request and waits for the matching response.
    fn call<'a>(&'a self, request: PeerRequest) -> BoxFuture<'a, Result<PeerResponse, CallError>>;

    /// Sends a gossip message and waits for the acknowledgement.
    fn gossip<'a>(&'a self, message: GossipMessage) -> BoxFuture<'a, Result<(), CallError>>;

    /// Closes the underlying connection.
    fn close(&self);

    /// Fires when the underlying connection closes.
    fn close_signal(&self) -> CancellationToken;
}
