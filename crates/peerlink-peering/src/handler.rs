//! The inbound side: requests and gossip arriving from peers.

use peerlink_transport::NodeAddress;

use crate::caller::BoxFuture;
use crate::error::HandlerError;
use crate::message::{GossipMessage, PeerRequest, PeerResponse};

/// Serves requests and absorbs gossip on behalf of the consensus layer.
///
/// [`PeerRequest::GetPeers`] is answered by the peering layer and never
/// reaches the handler.
pub trait RequestHandler: Send + Sync + 'static {
    /// Answers a request from `from`.
    fn handle_request<'a>(
        &'a self,
        from: &'a NodeAddress,
        request: PeerRequest,
    ) -> BoxFuture<'a, Result<PeerResponse, HandlerError>>;

    /// Processes a gossip message from `from`.
    ///
    /// Returning [`HandlerError::Invalid`] stops the sender from retrying.
    fn handle_gossip<'a>(
        &'a self,
        from: &'a NodeAddress,
        message: GossipMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// A handler that serves nothing and accepts all gossip.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl RequestHandler for NullHandler {
    fn handle_request<'a>(
        &'a self,
        _from: &'a NodeAddress,
        request: PeerRequest,
    ) -> BoxFuture<'a, Result<PeerResponse, HandlerError>> {
        Box::pin(async move {
            Err(HandlerError::Unavailable(format!(
                "{} is not served",
                request.method()
            )))
        })
    }

    fn handle_gossip<'a>(
        &'a self,
        _from: &'a NodeAddress,
        _message: GossipMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async { Ok(()) })
    }
}
