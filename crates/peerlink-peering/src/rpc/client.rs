use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peerlink_transport::{NodeAddress, SubStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RpcFrame, framed};
use crate::caller::{BoxFuture, PeerCaller};
use crate::error::{CallError, RemoteError};
use crate::message::{GossipMessage, PeerRequest, PeerResponse};

const OUTBOUND_BACKLOG: usize = 64;

#[derive(Debug)]
enum Reply {
    Response(Result<PeerResponse, RemoteError>),
    Ack(Result<(), RemoteError>),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Removes a pending entry when the call finishes or is abandoned.
struct PendingGuard {
    pending: Pending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Issues requests and gossip on this node's client sub-stream.
#[derive(Debug)]
pub struct RpcClient {
    addr: NodeAddress,
    outbound: mpsc::Sender<RpcFrame>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl RpcClient {
    /// Starts the reader and writer tasks on `stream`. Cancelling `closed`
    /// stops them; a broken stream cancels `closed`.
    #[must_use]
    pub fn spawn(stream: SubStream, addr: NodeAddress, closed: CancellationToken) -> Self {
        let (outbound, mut rx) = mpsc::channel::<RpcFrame>(OUTBOUND_BACKLOG);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (mut sink, mut source) = framed(stream).split();

        let writer_closed = closed.clone();
        let writer_peer = addr.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = writer_closed.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let sent = match frame.encode() {
                    Ok(bytes) => sink.send(bytes).await.map_err(CallError::from_io),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    debug!(peer = %writer_peer, error = %e, "RPC client write failed");
                    writer_closed.cancel();
                    break;
                }
            }
        });

        let reader_closed = closed.clone();
        let reader_pending = Arc::clone(&pending);
        let reader_peer = addr.clone();
        tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    () = reader_closed.cancelled() => break,
                    raw = source.next() => raw,
                };
                let raw = match raw {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => {
                        debug!(peer = %reader_peer, error = %e, "RPC client read failed");
                        break;
                    }
                    None => break,
                };
                let (id, reply) = match RpcFrame::decode(&raw) {
                    Ok(RpcFrame::Response { id, result }) => (id, Reply::Response(result)),
                    Ok(RpcFrame::Ack { id, result }) => (id, Reply::Ack(result)),
                    Ok(other) => {
                        debug!(peer = %reader_peer, frame = ?other, "Unexpected frame on client stream");
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %reader_peer, error = %e, "Undecodable frame on client stream");
                        break;
                    }
                };
                let waiter = reader_pending.lock().remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(reply);
                }
            }
            reader_closed.cancel();
            reader_pending.lock().clear();
        });

        Self {
            addr,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    async fn round_trip(&self, build: impl FnOnce(u64) -> RpcFrame) -> Result<Reply, CallError> {
        if self.closed.is_cancelled() {
            return Err(CallError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        tokio::select! {
            () = self.closed.cancelled() => return Err(CallError::Closed),
            sent = self.outbound.send(build(id)) => {
                sent.map_err(|_| CallError::Closed)?;
            }
        }
        tokio::select! {
            () = self.closed.cancelled() => Err(CallError::Closed),
            reply = rx => reply.map_err(|_| CallError::Closed),
        }
    }

    /// Sends a request and waits for its response.
    pub async fn request(&self, request: PeerRequest) -> Result<PeerResponse, CallError> {
        let method = request.method();
        let reply = self
            .round_trip(|id| RpcFrame::Request { id, request })
            .await?;
        match reply {
            Reply::Response(Ok(response)) if response.method() == method => Ok(response),
            Reply::Response(Ok(response)) => Err(CallError::Protocol(format!(
                "{} answered with {}",
                method,
                response.method()
            ))),
            Reply::Response(Err(e)) => Err(CallError::Remote(e)),
            Reply::Ack(_) => Err(CallError::Protocol("ack for a request".into())),
        }
    }

    /// Sends a gossip message and waits for its acknowledgement.
    pub async fn send_gossip(&self, message: GossipMessage) -> Result<(), CallError> {
        let reply = self
            .round_trip(|id| RpcFrame::Gossip { id, message })
            .await?;
        match reply {
            Reply::Ack(result) => result.map_err(CallError::Remote),
            Reply::Response(_) => Err(CallError::Protocol("response for gossip".into())),
        }
    }

    /// Calls awaiting an answer.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl PeerCaller for RpcClient {
    fn node_addr(&self) -> &NodeAddress {
        &self.addr
    }

    fn call<'a>(&'a self, request: PeerRequest) -> BoxFuture<'a, Result<PeerResponse, CallError>> {
        Box::pin(self.request(request))
    }

    fn gossip<'a>(&'a self, message: GossipMessage) -> BoxFuture<'a, Result<(), CallError>> {
        Box::pin(self.send_gossip(message))
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}
