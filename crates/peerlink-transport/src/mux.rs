//! Stream multiplexer.
//!
//! Every P2P connection carries one multiplexing session and exactly two
//! sub-streams. Each side opens one stream (its client sub-stream, carrying
//! requests it initiates) and accepts one stream (its server sub-stream,
//! carrying requests the remote initiates).
//!
//! The session role is inverted relative to who dialed: the dialer runs the
//! session in server role. The role only fixes stream-id parity.
//!
//! Frames travel one per secure-channel message:
//! `[kind u8][stream id u32 BE][payload]`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::address::NodeAddress;
use crate::channel::{SecureReader, SecureWriter};
use crate::error::{TransportError, TransportResult};
use crate::transport::P2pConn;
use crate::types::Initiator;

/// One logical byte stream inside a session.
pub type SubStream = DuplexStream;

const FRAME_HEADER_LEN: usize = 5;
const STREAM_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;
const INBOUND_DEPTH: usize = 64;
const OUTBOUND_DEPTH: usize = 256;

/// Default deadline for binding both sub-streams.
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Role of this node inside a multiplexing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Allocates odd stream ids.
    Client,
    /// Allocates even stream ids.
    Server,
}

impl SessionRole {
    const fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    const fn owns(self, id: u32) -> bool {
        match self {
            Self::Client => id % 2 == 1,
            Self::Server => id % 2 == 0,
        }
    }
}

/// Maps who dialed the connection to the session role.
#[must_use]
pub const fn session_role(initiator: Initiator) -> SessionRole {
    match initiator {
        Initiator::SelfInitiated => SessionRole::Server,
        Initiator::PeerInitiated => SessionRole::Client,
    }
}

/// Lifecycle of a multiplexed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxState {
    /// Session started, sub-streams not yet bound.
    Opening = 0,
    /// Both sub-streams are bound.
    Bound = 1,
    /// Close requested, layers shutting down.
    Closing = 2,
    /// All layers closed.
    Closed = 3,
}

impl MuxState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Bound,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Open = 0,
    Data = 1,
    Close = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    kind: FrameKind,
    stream_id: u32,
    payload: Bytes,
}

impl Frame {
    const fn control(kind: FrameKind, stream_id: u32) -> Self {
        Self {
            kind,
            stream_id,
            payload: Bytes::new(),
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    fn decode(raw: Vec<u8>) -> TransportResult<Self> {
        if raw.len() < FRAME_HEADER_LEN {
            return Err(TransportError::Mux(format!("short frame of {} bytes", raw.len())));
        }
        let kind = match raw[0] {
            0 => FrameKind::Open,
            1 => FrameKind::Data,
            2 => FrameKind::Close,
            other => return Err(TransportError::Mux(format!("unknown frame kind {other}"))),
        };
        let stream_id = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let payload = Bytes::from(raw).slice(FRAME_HEADER_LEN..);
        Ok(Self {
            kind,
            stream_id,
            payload,
        })
    }
}

/// Shared state of one multiplexing session.
struct Session {
    role: SessionRole,
    outbound: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    incoming_tx: mpsc::Sender<SubStream>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<SubStream>>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

struct PendingStream {
    user: SubStream,
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    inbound: mpsc::Receiver<Bytes>,
}

impl Session {
    fn start(reader: SecureReader, writer: SecureWriter, role: SessionRole) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel(2);
        let session = Arc::new(Self {
            role,
            outbound,
            streams: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            next_id: AtomicU32::new(role.first_stream_id()),
            closed: CancellationToken::new(),
        });
        tokio::spawn(write_pump(writer, outbound_rx, session.closed.clone()));
        tokio::spawn(read_pump(reader, Arc::clone(&session)));
        session
    }

    fn register(&self, id: u32) -> PendingStream {
        let (user, inner) = tokio::io::duplex(STREAM_BUFFER);
        let (read, write) = tokio::io::split(inner);
        let (tx, inbound) = mpsc::channel(INBOUND_DEPTH);
        self.streams.lock().insert(id, tx);
        PendingStream {
            user,
            read,
            write,
            inbound,
        }
    }

    fn spawn_pumps(&self, id: u32, pending: PendingStream) -> SubStream {
        tokio::spawn(stream_outbound(
            id,
            pending.read,
            self.outbound.clone(),
            self.closed.clone(),
        ));
        tokio::spawn(stream_inbound(
            pending.inbound,
            pending.write,
            self.closed.clone(),
        ));
        pending.user
    }

    async fn open(&self) -> TransportResult<SubStream> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let pending = self.register(id);
        self.outbound
            .send(Frame::control(FrameKind::Open, id))
            .await
            .map_err(|_| TransportError::Closed)?;
        trace!(stream = id, "Opened sub-stream");
        Ok(self.spawn_pumps(id, pending))
    }

    async fn accept(&self) -> TransportResult<SubStream> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            stream = incoming.recv() => stream.ok_or(TransportError::Closed),
        }
    }

    async fn dispatch(&self, frame: Frame) -> TransportResult<()> {
        match frame.kind {
            FrameKind::Open => {
                let id = frame.stream_id;
                if self.role.owns(id) || self.streams.lock().contains_key(&id) {
                    return Err(TransportError::Mux(format!("unexpected open for stream {id}")));
                }
                let pending = self.register(id);
                let user = self.spawn_pumps(id, pending);
                if self.incoming_tx.try_send(user).is_err() {
                    self.streams.lock().remove(&id);
                    let _ = self.outbound.try_send(Frame::control(FrameKind::Close, id));
                }
                trace!(stream = id, "Accepted sub-stream");
            }
            FrameKind::Data => {
                let sender = self.streams.lock().get(&frame.stream_id).cloned();
                if let Some(sender) = sender {
                    tokio::select! {
                        () = self.closed.cancelled() => return Err(TransportError::Closed),
                        _ = sender.send(frame.payload) => {}
                    }
                }
            }
            FrameKind::Close => {
                self.streams.lock().remove(&frame.stream_id);
                trace!(stream = frame.stream_id, "Remote closed sub-stream");
            }
        }
        Ok(())
    }
}

async fn read_pump(mut reader: SecureReader, session: Arc<Session>) {
    loop {
        let msg = tokio::select! {
            () = session.closed.cancelled() => break,
            msg = reader.read_message() => msg,
        };
        let result = match msg {
            Ok(raw) => match Frame::decode(raw) {
                Ok(frame) => session.dispatch(frame).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(error = %e, "Session read pump stopped");
            break;
        }
    }
    session.streams.lock().clear();
    session.closed.cancel();
}

async fn write_pump(
    mut writer: SecureWriter,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = closed.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_message(&frame.encode()).await {
            debug!(error = %e, "Session write pump stopped");
            break;
        }
    }
    let _ = writer.shutdown().await;
    closed.cancel();
}

async fn stream_outbound(
    id: u32,
    mut read: ReadHalf<DuplexStream>,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            () = closed.cancelled() => return,
            n = read.read(&mut buf) => n,
        };
        match n {
            Ok(0) | Err(_) => {
                let _ = outbound.send(Frame::control(FrameKind::Close, id)).await;
                return;
            }
            Ok(n) => {
                let frame = Frame {
                    kind: FrameKind::Data,
                    stream_id: id,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                };
                if outbound.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn stream_inbound(
    mut inbound: mpsc::Receiver<Bytes>,
    mut write: WriteHalf<DuplexStream>,
    closed: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            () = closed.cancelled() => return,
            chunk = inbound.recv() => chunk,
        };
        match chunk {
            Some(chunk) => {
                if write.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            None => {
                let _ = write.shutdown().await;
                return;
            }
        }
    }
}

/// Clonable handle to a multiplexed connection's lifetime.
#[derive(Debug, Clone)]
pub struct MuxHandle {
    local: NodeAddress,
    remote: NodeAddress,
    initiator: Initiator,
    protocol_version: u32,
    closed: CancellationToken,
    state: Arc<AtomicU8>,
}

impl MuxHandle {
    /// Address of this node on the connection.
    #[must_use]
    pub const fn local_addr(&self) -> &NodeAddress {
        &self.local
    }

    /// Address of the remote node.
    #[must_use]
    pub const fn remote_addr(&self) -> &NodeAddress {
        &self.remote
    }

    /// Which side dialed.
    #[must_use]
    pub const fn initiator(&self) -> Initiator {
        self.initiator
    }

    /// Negotiated protocol version.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MuxState {
        MuxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Closes the connection, the session and both sub-streams. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Returns true once close has been requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the connection closes.
    #[must_use]
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Resolves once the connection closes.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// A connection split into its client and server sub-streams.
#[derive(Debug)]
pub struct MuxConn {
    handle: MuxHandle,
    client: SubStream,
    server: SubStream,
}

impl MuxConn {
    /// Lifetime handle.
    #[must_use]
    pub const fn handle(&self) -> &MuxHandle {
        &self.handle
    }

    /// Stream carrying requests this node initiates.
    pub fn client_stream(&mut self) -> &mut SubStream {
        &mut self.client
    }

    /// Stream carrying requests the remote node initiates.
    pub fn server_stream(&mut self) -> &mut SubStream {
        &mut self.server
    }

    /// Takes ownership of the handle and both sub-streams.
    pub fn into_parts(self) -> (MuxHandle, SubStream, SubStream) {
        (self.handle, self.client, self.server)
    }
}

/// Turns negotiated P2P connections into multiplexed connections.
#[derive(Debug, Clone, Copy)]
pub struct Multiplexer {
    bind_timeout: Duration,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_TIMEOUT)
    }
}

impl Multiplexer {
    /// Creates a multiplexer with the given bind deadline.
    #[must_use]
    pub const fn new(bind_timeout: Duration) -> Self {
        Self { bind_timeout }
    }

    /// Starts a session on `conn` and binds both sub-streams.
    pub async fn handle_connection(&self, conn: P2pConn) -> TransportResult<MuxConn> {
        let role = session_role(conn.initiator());
        let local = conn.local_addr().clone();
        let remote = conn.remote_addr().clone();
        let initiator = conn.initiator();
        let protocol_version = conn.protocol_version();
        let (reader, writer, conn_closed) = conn.into_parts();

        let session = Session::start(reader, writer, role);
        let closed = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(MuxState::Opening as u8));
        tokio::spawn(monitor(
            session.closed.clone(),
            conn_closed,
            closed.clone(),
            Arc::clone(&state),
        ));

        let bind = async {
            let client = session.open().await?;
            let server = session.accept().await?;
            Ok::<_, TransportError>((client, server))
        };
        let (client, server) = match tokio::time::timeout(self.bind_timeout, bind).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                closed.cancel();
                return Err(TransportError::Mux(e.to_string()));
            }
            Err(_) => {
                closed.cancel();
                return Err(TransportError::Mux("timed out binding sub-streams".into()));
            }
        };
        let _ = state.compare_exchange(
            MuxState::Opening as u8,
            MuxState::Bound as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!(peer = %remote, role = ?role, "Multiplexed connection bound");

        Ok(MuxConn {
            handle: MuxHandle {
                local,
                remote,
                initiator,
                protocol_version,
                closed,
                state,
            },
            client,
            server,
        })
    }
}

/// Closes all three layers as soon as any one of them closes.
async fn monitor(
    session: CancellationToken,
    connection: CancellationToken,
    mux: CancellationToken,
    state: Arc<AtomicU8>,
) {
    tokio::select! {
        () = session.cancelled() => {}
        () = connection.cancelled() => {}
        () = mux.cancelled() => {}
    }
    state.store(MuxState::Closing as u8, Ordering::Release);
    mux.cancel();
    session.cancel();
    connection.cancel();
    state.store(MuxState::Closed as u8, Ordering::Release);
}

#[cfg(test)]
#[path = "mux_tests.rs"]
mod tests;
