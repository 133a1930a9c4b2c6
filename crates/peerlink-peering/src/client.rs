//! Load-balanced access to all active peers.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::RequestItem;
use crate::error::CallError;
use crate::message::{GossipClass, GossipMessage, PeerRequest, PeerResponse};
use crate::queue::{PushError, SharedQueue};

/// How a call waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Wait for room in the shared queue. If false a full queue fails
    /// with [`CallError::WouldBlock`].
    pub can_block: bool,
    /// Upper bound on queueing plus the call itself.
    pub timeout: Duration,
}

impl CallOptions {
    /// Waits for queue room, then up to `timeout` overall.
    #[must_use]
    pub const fn blocking(timeout: Duration) -> Self {
        Self {
            can_block: true,
            timeout,
        }
    }

    /// Fails immediately if the queue is full.
    #[must_use]
    pub const fn non_blocking(timeout: Duration) -> Self {
        Self {
            can_block: false,
            timeout,
        }
    }
}

/// Sends requests to whichever active peer picks them up first and
/// broadcasts gossip to every active peer. Cloning shares the queues.
#[derive(Debug, Clone)]
pub struct PeerClient {
    requests: SharedQueue<RequestItem>,
    consensus: SharedQueue<GossipMessage>,
    transactions: SharedQueue<GossipMessage>,
    closed: CancellationToken,
}

impl PeerClient {
    pub(crate) const fn new(
        requests: SharedQueue<RequestItem>,
        consensus: SharedQueue<GossipMessage>,
        transactions: SharedQueue<GossipMessage>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            requests,
            consensus,
            transactions,
            closed,
        }
    }

    /// Queues `request` for the next free request worker of any peer and
    /// waits for its answer.
    pub async fn request(
        &self,
        request: PeerRequest,
        options: CallOptions,
    ) -> Result<PeerResponse, CallError> {
        if self.closed.is_cancelled() {
            return Err(CallError::Closed);
        }
        let (item, reply) = RequestItem::new(request);
        let exchange = async {
            enqueue(&self.requests, item, options.can_block, &self.closed).await?;
            reply.await.unwrap_or(Err(CallError::Closed))
        };
        tokio::select! {
            () = self.closed.cancelled() => Err(CallError::Closed),
            result = tokio::time::timeout(options.timeout, exchange) => {
                result.unwrap_or(Err(CallError::Timeout))
            }
        }
    }

    /// Queues `message` for broadcast to every active peer. Consensus and
    /// transaction gossip use separate queues.
    pub async fn gossip(&self, message: GossipMessage, can_block: bool) -> Result<(), CallError> {
        let queue = match message.class() {
            GossipClass::Consensus => &self.consensus,
            GossipClass::Transaction => &self.transactions,
        };
        enqueue(queue, message, can_block, &self.closed).await
    }

    /// Requests waiting for a worker.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}

async fn enqueue<T: Send>(
    queue: &SharedQueue<T>,
    item: T,
    can_block: bool,
    closed: &CancellationToken,
) -> Result<(), CallError> {
    if closed.is_cancelled() {
        return Err(CallError::Closed);
    }
    if !can_block {
        return queue.try_push(item).map_err(|(e, _)| match e {
            PushError::Full => CallError::WouldBlock,
            PushError::Closed => CallError::Closed,
        });
    }
    tokio::select! {
        () = closed.cancelled() => Err(CallError::Closed),
        pushed = queue.push(item) => if pushed { Ok(()) } else { Err(CallError::Closed) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    fn make_client(backlog: usize) -> (PeerClient, SharedQueue<RequestItem>, CancellationToken) {
        let requests = SharedQueue::new(backlog);
        let closed = CancellationToken::new();
        let client = PeerClient::new(
            requests.clone(),
            SharedQueue::new(backlog),
            SharedQueue::new(backlog),
            closed.clone(),
        );
        (client, requests, closed)
    }

    // ========== Request Tests ==========

    #[tokio::test]
    async fn non_blocking_request_on_full_queue_would_block() {
        let (client, _requests, _closed) = make_client(1);
        let (filler, _reply) = RequestItem::new(PeerRequest::GetPeers);
        client.requests.try_push(filler).expect("room for one");

        let err = client
            .request(
                PeerRequest::Status(Payload::default()),
                CallOptions::non_blocking(Duration::from_secs(1)),
            )
            .await
            .expect_err("full");
        assert_eq!(err, CallError::WouldBlock);
    }

    #[tokio::test]
    async fn request_is_answered_by_a_worker() {
        let (client, requests, _closed) = make_client(4);
        tokio::spawn(async move {
            if let Some(item) = requests.pop().await {
                let RequestItem { request, reply } = item;
                let _ = reply.send(Ok(PeerResponse::Status(match request {
                    PeerRequest::Status(body) => body,
                    _ => Payload::default(),
                })));
            }
        });

        let response = client
            .request(
                PeerRequest::Status(Payload::new(vec![4])),
                CallOptions::blocking(Duration::from_secs(5)),
            )
            .await
            .expect("answered");
        assert_eq!(response, PeerResponse::Status(Payload::new(vec![4])));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (client, requests, _closed) = make_client(4);
        let err = client
            .request(PeerRequest::GetPeers, CallOptions::blocking(Duration::from_secs(2)))
            .await
            .expect_err("no worker");
        assert_eq!(err, CallError::Timeout);
        drop(requests);
    }

    #[tokio::test]
    async fn closed_client_rejects_calls() {
        let (client, _requests, closed) = make_client(4);
        closed.cancel();
        assert_eq!(
            client
                .request(PeerRequest::GetPeers, CallOptions::blocking(Duration::from_secs(1)))
                .await,
            Err(CallError::Closed)
        );
        assert_eq!(
            client
                .gossip(GossipMessage::NextHeight(Payload::default()), true)
                .await,
            Err(CallError::Closed)
        );
    }

    // ========== Gossip Tests ==========

    #[tokio::test]
    async fn gossip_is_routed_by_class() {
        let (client, _requests, _closed) = make_client(1);
        client
            .gossip(GossipMessage::Transaction(Payload::new(vec![1])), false)
            .await
            .expect("tx queued");
        client
            .gossip(GossipMessage::PreCommit(Payload::new(vec![2])), false)
            .await
            .expect("consensus queued");

        assert_eq!(client.transactions.len(), 1);
        assert_eq!(client.consensus.len(), 1);
        assert_eq!(
            client
                .gossip(GossipMessage::Transaction(Payload::new(vec![3])), false)
                .await,
            Err(CallError::WouldBlock)
        );
    }
}
