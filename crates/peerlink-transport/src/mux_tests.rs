//! Tests for the stream multiplexer.

use super::*;
use crate::channel::SecureChannel;
use crate::handshake::{initiate, respond};
use crate::identity::StaticKey;
use crate::negotiate::Negotiated;
use crate::types::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const WAIT: Duration = Duration::from_secs(5);

fn negotiated() -> Negotiated {
    Negotiated {
        chain_id: 1,
        remote_port: 4000,
        version: 1,
        protocol: Protocol::P2p,
    }
}

async fn conn_pair() -> (P2pConn, P2pConn) {
    let alice = StaticKey::generate();
    let bob = StaticKey::generate();
    let (mut a, mut b) = tokio::io::duplex(256 * 1024);
    let (ka, kb) = tokio::join!(
        initiate(&mut a, alice.clone(), bob.identity(), WAIT),
        respond(&mut b, bob.clone(), WAIT),
    );
    let a_addr = NodeAddress::new(1, alice.identity(), "127.0.0.1", 4000);
    let b_addr = NodeAddress::new(1, bob.identity(), "127.0.0.1", 4001);
    (
        P2pConn::new(
            SecureChannel::new(Box::new(a), ka.expect("initiator")),
            a_addr.clone(),
            b_addr.clone(),
            Initiator::SelfInitiated,
            negotiated(),
        ),
        P2pConn::new(
            SecureChannel::new(Box::new(b), kb.expect("responder")),
            b_addr,
            a_addr,
            Initiator::PeerInitiated,
            negotiated(),
        ),
    )
}

async fn mux_pair() -> (MuxConn, MuxConn) {
    let (a, b) = conn_pair().await;
    let mux = Multiplexer::default();
    let (ma, mb) = tokio::join!(mux.handle_connection(a), mux.handle_connection(b));
    (ma.expect("mux a"), mb.expect("mux b"))
}

async fn read_exact_in_time(stream: &mut SubStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read in time")
        .expect("read");
    buf
}

// ========== Role Tests ==========

#[test]
fn dialer_runs_session_server() {
    assert_eq!(session_role(Initiator::SelfInitiated), SessionRole::Server);
    assert_eq!(session_role(Initiator::PeerInitiated), SessionRole::Client);
}

#[test]
fn roles_use_disjoint_stream_ids() {
    assert!(SessionRole::Client.owns(SessionRole::Client.first_stream_id()));
    assert!(SessionRole::Server.owns(SessionRole::Server.first_stream_id()));
    assert!(!SessionRole::Client.owns(SessionRole::Server.first_stream_id()));
}

// ========== Frame Tests ==========

#[test]
fn frame_decode_rejects_garbage() {
    assert!(Frame::decode(vec![1, 0, 0]).is_err());
    assert!(Frame::decode(vec![9, 0, 0, 0, 1]).is_err());
}

#[test]
fn frame_decode_reads_header() {
    let frame = Frame {
        kind: FrameKind::Data,
        stream_id: 7,
        payload: Bytes::from_static(b"abc"),
    };
    let decoded = Frame::decode(frame.encode().to_vec()).expect("decode");
    assert_eq!(decoded, frame);
}

// ========== Session Tests ==========

#[tokio::test]
async fn client_stream_feeds_remote_server_stream() {
    let (mut a, mut b) = mux_pair().await;
    assert_eq!(a.handle().state(), MuxState::Bound);
    assert_eq!(b.handle().state(), MuxState::Bound);

    a.client_stream().write_all(b"request from a").await.expect("write");
    assert_eq!(read_exact_in_time(b.server_stream(), 14).await, b"request from a");

    b.client_stream().write_all(b"request from b").await.expect("write");
    assert_eq!(read_exact_in_time(a.server_stream(), 14).await, b"request from b");

    b.server_stream().write_all(b"reply").await.expect("write");
    assert_eq!(read_exact_in_time(a.client_stream(), 5).await, b"reply");
}

#[tokio::test]
async fn large_payload_is_chunked() {
    let (a, mut b) = mux_pair().await;
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let (_a_handle, mut client, _a_server) = a.into_parts();
    let writer = tokio::spawn(async move {
        client.write_all(&payload).await.expect("write");
        client
    });
    let got = read_exact_in_time(b.server_stream(), expected.len()).await;
    assert_eq!(got, expected);
    let _client = writer.await.expect("join");
}

#[tokio::test]
async fn local_close_tears_down_both_ends() {
    let (a, b) = mux_pair().await;
    let (a_handle, _a_client, _a_server) = a.into_parts();
    let (b_handle, _b_client, mut b_server) = b.into_parts();

    a_handle.close();
    a_handle.close();
    assert!(a_handle.is_closed());

    tokio::time::timeout(WAIT, b_handle.closed())
        .await
        .expect("remote observes close");
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(WAIT, b_server.read(&mut buf))
        .await
        .expect("eof in time")
        .unwrap_or(0);
    assert_eq!(n, 0);

    tokio::time::timeout(WAIT, async {
        while a_handle.state() != MuxState::Closed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state reaches closed");
}

#[tokio::test]
async fn connection_close_closes_mux() {
    let (a, b) = conn_pair().await;
    let signal = a.close_signal();
    let mux = Multiplexer::default();
    let (ma, mb) = tokio::join!(mux.handle_connection(a), mux.handle_connection(b));
    let ma = ma.expect("mux a");
    let _mb = mb.expect("mux b");

    signal.cancel();
    tokio::time::timeout(WAIT, ma.handle().closed())
        .await
        .expect("mux observes connection close");
}

#[tokio::test(start_paused = true)]
async fn bind_times_out_without_remote_session() {
    let (a, _b) = conn_pair().await;
    let result = Multiplexer::new(Duration::from_secs(1))
        .handle_connection(a)
        .await;
    assert!(matches!(result, Err(TransportError::Mux(_))));
}
