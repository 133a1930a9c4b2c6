//! Tests for RPC framing between a client and a server sub-stream.

use super::*;
use crate::caller::{BoxFuture, PeerCaller};
use crate::error::HandlerError;
use crate::message::Payload;
use crate::handler::RequestHandler;
use peerlink_transport::{NodeAddress, StaticKey};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Echoes status payloads after a delay of `payload[0]` milliseconds and
/// rejects empty gossip as invalid.
struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle_request<'a>(
        &'a self,
        _from: &'a NodeAddress,
        request: PeerRequest,
    ) -> BoxFuture<'a, Result<PeerResponse, HandlerError>> {
        Box::pin(async move {
            match request {
                PeerRequest::Status(body) => {
                    let delay = body.as_bytes().first().copied().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
                    Ok(PeerResponse::Status(body))
                }
                PeerRequest::GetMinedTxs(_) => Ok(PeerResponse::GetPendingTxs(Payload::default())),
                other => Err(HandlerError::Unavailable(other.method().to_string())),
            }
        })
    }

    fn handle_gossip<'a>(
        &'a self,
        _from: &'a NodeAddress,
        message: GossipMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if message.payload().is_empty() {
                Err(HandlerError::Invalid("empty".into()))
            } else {
                Ok(())
            }
        })
    }
}

fn make_addr() -> NodeAddress {
    NodeAddress::new(1, StaticKey::generate().identity(), "127.0.0.1", 4200)
}

fn make_pair() -> (RpcClient, CancellationToken) {
    make_pair_with_slots(8)
}

fn make_pair_with_slots(max_in_flight: usize) -> (RpcClient, CancellationToken) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let closed = CancellationToken::new();
    serve(server_end, make_addr(), Arc::new(EchoHandler), closed.clone(), max_in_flight);
    (RpcClient::spawn(client_end, make_addr(), closed.clone()), closed)
}

// ========== Request Tests ==========

#[tokio::test]
async fn request_round_trip() {
    let (client, _closed) = make_pair();
    let response = tokio::time::timeout(WAIT, client.request(PeerRequest::Status(vec![0, 7].into())))
        .await
        .expect("in time")
        .expect("response");
    assert_eq!(response, PeerResponse::Status(vec![0, 7].into()));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_resolve_by_id() {
    let (client, _closed) = make_pair();
    let slow = client.request(PeerRequest::Status(vec![200].into()));
    let fast = client.request(PeerRequest::Status(vec![10].into()));
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.expect("slow"), PeerResponse::Status(vec![200].into()));
    assert_eq!(fast.expect("fast"), PeerResponse::Status(vec![10].into()));
}

#[tokio::test]
async fn handler_errors_reach_the_caller() {
    let (client, _closed) = make_pair();
    let err = client
        .request(PeerRequest::GetBlockHeaders(Payload::default()))
        .await
        .expect_err("unserved");
    assert_eq!(
        err,
        CallError::Remote(RemoteError::Unavailable("get_block_headers".into()))
    );
}

#[tokio::test]
async fn mismatched_response_is_a_protocol_error() {
    let (client, _closed) = make_pair();
    let err = client
        .request(PeerRequest::GetMinedTxs(Payload::default()))
        .await
        .expect_err("wrong kind");
    assert!(matches!(err, CallError::Protocol(_)));
}

#[tokio::test(start_paused = true)]
async fn saturated_server_rejects_instead_of_stalling() {
    let (client, _closed) = make_pair_with_slots(1);
    let slow = client.request(PeerRequest::Status(vec![200].into()));
    let rejected = client.request(PeerRequest::Status(vec![1].into()));
    let (slow, rejected) = tokio::join!(slow, rejected);

    assert_eq!(slow.expect("slow"), PeerResponse::Status(vec![200].into()));
    assert_eq!(
        rejected,
        Err(CallError::Remote(RemoteError::Unavailable("server busy".into())))
    );

    let response = client
        .request(PeerRequest::Status(vec![0].into()))
        .await
        .expect("slot released");
    assert_eq!(response, PeerResponse::Status(vec![0].into()));
}

#[tokio::test(start_paused = true)]
async fn saturated_server_keeps_draining_its_stream() {
    let (client, _closed) = make_pair_with_slots(1);
    let slow = client.request(PeerRequest::Status(vec![250].into()));
    let burst = futures::future::join_all(
        (0..64u8).map(|_| client.request(PeerRequest::Status(vec![1].into()))),
    );
    let (slow, burst) = tokio::join!(slow, burst);

    assert!(slow.is_ok());
    assert!(burst.iter().all(|r| matches!(r, Err(CallError::Remote(RemoteError::Unavailable(_))))));
    assert_eq!(client.in_flight(), 0);
}

// ========== Gossip Tests ==========

#[tokio::test]
async fn gossip_is_acknowledged() {
    let (client, _closed) = make_pair();
    let caller: &dyn PeerCaller = &client;
    caller
        .gossip(GossipMessage::Proposal(vec![1, 2, 3].into()))
        .await
        .expect("ack");
    let err = caller
        .gossip(GossipMessage::PreVote(Payload::default()))
        .await
        .expect_err("invalid");
    assert!(err.is_invalid());
}

// ========== Close Tests ==========

#[tokio::test]
async fn closed_client_fails_fast() {
    let (client, closed) = make_pair();
    closed.cancel();
    let err = client
        .request(PeerRequest::Status(Payload::default()))
        .await
        .expect_err("closed");
    assert_eq!(err, CallError::Closed);
}

#[tokio::test]
async fn broken_stream_closes_client() {
    let (client_end, server_end) = tokio::io::duplex(1024);
    let closed = CancellationToken::new();
    let client = RpcClient::spawn(client_end, make_addr(), closed.clone());
    drop(server_end);

    tokio::time::timeout(WAIT, closed.cancelled())
        .await
        .expect("close observed");
    assert_eq!(
        client.request(PeerRequest::GetPeers).await,
        Err(CallError::Closed)
    );
}

#[tokio::test]
async fn garbage_on_server_stream_closes_connection() {
    use futures::SinkExt;

    let (client_end, server_end) = tokio::io::duplex(1024);
    let closed = CancellationToken::new();
    serve(server_end, make_addr(), Arc::new(EchoHandler), closed.clone(), 1);
    let mut raw = framed(client_end);
    raw.send(bytes::Bytes::from_static(b"not json")).await.expect("send");

    tokio::time::timeout(WAIT, closed.cancelled())
        .await
        .expect("close observed");
}
