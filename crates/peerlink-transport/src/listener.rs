//! Accept loop with admission control.
//!
//! The loop never blocks on a handshake: each accepted socket is admitted by
//! origin, then handed to its own task that runs the handshake and the
//! negotiation under a deadline. Finished connections and rejections are
//! delivered through a bounded event queue.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::NodeAddress;
use crate::channel::SecureChannel;
use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::handshake::respond;
use crate::identity::StaticKey;
use crate::limiter::{ConnectionLimiter, OriginPermit};
use crate::negotiate::{LocalParams, negotiate_inbound};
use crate::transport::P2pConn;
use crate::types::Initiator;

/// Result of one inbound connection attempt.
#[derive(Debug)]
pub enum AcceptEvent {
    /// A fully authenticated and negotiated connection.
    Accepted(P2pConn),
    /// The connection was refused or failed its handshake.
    Rejected {
        /// Remote socket address.
        remote: SocketAddr,
    },
}

struct ListenerContext {
    config: TransportConfig,
    key: StaticKey,
    limiter: ConnectionLimiter,
    params: LocalParams,
    events: mpsc::Sender<AcceptEvent>,
    closed: CancellationToken,
}

/// Listening socket producing secure connections.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    limiter: ConnectionLimiter,
    events: Mutex<mpsc::Receiver<AcceptEvent>>,
    closed: CancellationToken,
}

impl Listener {
    /// Binds the configured address and starts the accept loop.
    pub async fn bind(config: TransportConfig, key: StaticKey) -> TransportResult<Self> {
        let socket = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = socket.local_addr()?;
        let limits = config.admission_limits();
        let limiter = ConnectionLimiter::new(limits);
        let (tx, rx) = mpsc::channel(limits.total.max(1));
        let closed = CancellationToken::new();

        info!(
            addr = %local_addr,
            total = limits.total,
            per_origin = limits.per_origin,
            "Listener bound"
        );

        let ctx = Arc::new(ListenerContext {
            params: LocalParams {
                chain_id: config.chain_id,
                port: local_addr.port(),
                version: config.protocol_version,
            },
            config,
            key,
            limiter: limiter.clone(),
            events: tx,
            closed: closed.clone(),
        });
        tokio::spawn(accept_loop(socket, ctx));

        Ok(Self {
            local_addr,
            limiter,
            events: Mutex::new(rx),
            closed,
        })
    }

    /// Bound socket address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Admission counters.
    #[must_use]
    pub const fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    /// Waits for the next accept event.
    pub async fn next_event(&self) -> TransportResult<AcceptEvent> {
        let mut events = self.events.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            event = events.recv() => event.ok_or(TransportError::Closed),
        }
    }

    /// Stops accepting. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn accept_loop(socket: TcpListener, ctx: Arc<ListenerContext>) {
    loop {
        let accepted = tokio::select! {
            () = ctx.closed.cancelled() => break,
            accepted = socket.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let Some(permit) = ctx.limiter.admit_origin(remote.ip()) else {
            drop(stream);
            let _ = ctx.events.try_send(AcceptEvent::Rejected { remote });
            continue;
        };

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let event = tokio::select! {
                () = ctx.closed.cancelled() => return,
                result = establish(stream, remote, permit, &ctx) => match result {
                    Ok(conn) => AcceptEvent::Accepted(conn),
                    Err(e) => {
                        debug!(remote = %remote, error = %e, "Inbound connection rejected");
                        AcceptEvent::Rejected { remote }
                    }
                },
            };
            tokio::select! {
                () = ctx.closed.cancelled() => {}
                _ = ctx.events.send(event) => {}
            }
        });
    }
    debug!("Accept loop stopped");
}

async fn establish(
    mut stream: TcpStream,
    remote: SocketAddr,
    origin: OriginPermit,
    ctx: &ListenerContext,
) -> TransportResult<P2pConn> {
    let _ = stream.set_nodelay(true);
    let deadline = ctx.config.handshake_timeout;
    let keys = respond(&mut stream, ctx.key.clone(), deadline).await?;
    let remote_identity = keys.remote;

    let Some(identity_permit) = ctx.limiter.admit_identity(remote_identity) else {
        return Err(TransportError::AdmissionRejected {
            ip: remote.ip(),
            reason: "identity limit",
        });
    };

    let mut channel = SecureChannel::new(Box::new(stream), keys);
    let negotiated = negotiate_inbound(
        &mut channel,
        &ctx.params,
        &ctx.config.served_protocols,
        deadline,
    )
    .await?;

    channel.on_close(move || {
        drop(origin);
        drop(identity_permit);
    });

    let remote_addr = NodeAddress::new(
        ctx.params.chain_id,
        remote_identity,
        remote.ip().to_string(),
        negotiated.remote_port,
    );
    let local_addr = NodeAddress::new(
        ctx.params.chain_id,
        ctx.key.identity(),
        ctx.config.host.clone(),
        ctx.params.port,
    );
    Ok(P2pConn::new(
        channel,
        local_addr,
        remote_addr,
        Initiator::PeerInitiated,
        negotiated,
    ))
}
