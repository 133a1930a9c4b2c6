use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use peerlink_transport::{NodeAddress, SubStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const BUSY: &str = "server busy";

use super::{RpcFrame, framed};
use crate::error::{CallError, RemoteError};
use crate::handler::RequestHandler;

/// Answers the remote's requests and gossip on this node's server sub-stream.
///
/// At most `max_in_flight` handler calls run at once. The stream is always
/// drained: frames arriving while every slot is taken are answered with
/// [`RemoteError::Unavailable`] instead of waiting, and never hold up the
/// session carrying this node's own client stream.
/// Any protocol violation cancels `closed`.
pub fn serve(
    stream: SubStream,
    from: NodeAddress,
    handler: Arc<dyn RequestHandler>,
    closed: CancellationToken,
    max_in_flight: usize,
) {
    let (mut sink, mut source) = framed(stream).split();
    let (replies, mut reply_rx) = mpsc::channel::<RpcFrame>(max_in_flight.max(1));

    let writer_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = writer_closed.cancelled() => break,
                frame = reply_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let sent = match frame.encode() {
                Ok(bytes) => sink.send(bytes).await.map_err(CallError::from_io),
                Err(e) => Err(e),
            };
            if sent.is_err() {
                writer_closed.cancel();
                break;
            }
        }
    });

    let limit = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let from = Arc::new(from);
    tokio::spawn(async move {
        loop {
            let raw = tokio::select! {
                () = closed.cancelled() => break,
                raw = source.next() => raw,
            };
            let Some(Ok(raw)) = raw else {
                break;
            };
            let frame = match RpcFrame::decode(&raw) {
                Ok(frame @ (RpcFrame::Request { .. } | RpcFrame::Gossip { .. })) => frame,
                Ok(other) => {
                    debug!(peer = %from, frame = ?other, "Unexpected frame on server stream");
                    break;
                }
                Err(e) => {
                    debug!(peer = %from, error = %e, "Undecodable frame on server stream");
                    break;
                }
            };
            let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
                let reply = busy_reply(&from, frame);
                tokio::select! {
                    () = closed.cancelled() => break,
                    _ = replies.send(reply) => {}
                }
                continue;
            };

            let handler = Arc::clone(&handler);
            let from = Arc::clone(&from);
            let replies = replies.clone();
            let task_closed = closed.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let reply = match frame {
                    RpcFrame::Request { id, request } => {
                        trace!(peer = %from, method = request.method(), "Serving request");
                        let result = handler
                            .handle_request(&from, request)
                            .await
                            .map_err(RemoteError::from);
                        RpcFrame::Response { id, result }
                    }
                    RpcFrame::Gossip { id, message } => {
                        trace!(peer = %from, kind = message.kind(), "Serving gossip");
                        let result = handler
                            .handle_gossip(&from, message)
                            .await
                            .map_err(RemoteError::from);
                        RpcFrame::Ack { id, result }
                    }
                    RpcFrame::Response { .. } | RpcFrame::Ack { .. } => return,
                };
                tokio::select! {
                    () = task_closed.cancelled() => {}
                    _ = replies.send(reply) => {}
                }
            });
        }
        closed.cancel();
    });
}

fn busy_reply(from: &NodeAddress, frame: RpcFrame) -> RpcFrame {
    match frame {
        RpcFrame::Request { id, request } => {
            trace!(peer = %from, method = request.method(), "Rejecting request; server busy");
            RpcFrame::Response {
                id,
                result: Err(RemoteError::Unavailable(BUSY.into())),
            }
        }
        RpcFrame::Gossip { id, .. } | RpcFrame::Response { id, .. } | RpcFrame::Ack { id, .. } => RpcFrame::Ack {
            id,
            result: Err(RemoteError::Unavailable(BUSY.into())),
        },
    }
}
