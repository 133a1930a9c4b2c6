//! Tests for dialing and accepting over loopback TCP.

use super::*;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn loopback(chain_id: u32) -> TransportConfig {
    TransportConfig::default()
        .with_host("127.0.0.1")
        .with_port(0)
        .with_chain_id(chain_id)
        .with_handshake_timeout(Duration::from_secs(2))
}

async fn make_transport(config: TransportConfig) -> P2pTransport {
    P2pTransport::bind(config, StaticKey::generate())
        .await
        .expect("bind")
}

async fn next_event(transport: &P2pTransport) -> AcceptEvent {
    tokio::time::timeout(WAIT, transport.accept_event())
        .await
        .expect("event in time")
        .expect("listener open")
}

// ========== Dial / Accept Tests ==========

#[tokio::test]
async fn dial_and_accept_exchange_messages() {
    let a = make_transport(loopback(5)).await;
    let b = make_transport(loopback(5)).await;

    let (dialed, accepted) = tokio::join!(
        a.dial(b.node_addr(), Protocol::P2p),
        tokio::time::timeout(WAIT, b.accept()),
    );
    let mut dialed = dialed.expect("dial");
    let mut accepted = accepted.expect("in time").expect("accept");

    assert_eq!(dialed.remote_identity(), b.node_addr().identity());
    assert_eq!(accepted.remote_identity(), a.node_addr().identity());
    assert_eq!(accepted.remote_addr().port(), a.node_addr().port());
    assert_eq!(dialed.initiator(), Initiator::SelfInitiated);
    assert_eq!(accepted.initiator(), Initiator::PeerInitiated);
    assert_eq!(accepted.protocol(), Protocol::P2p);
    assert_eq!(accepted.protocol_version(), crate::types::PROTOCOL_VERSION);

    dialed.write_message(b"over tcp").await.expect("write");
    assert_eq!(accepted.read_message().await.expect("read"), b"over tcp");
}

#[tokio::test]
async fn chain_mismatch_is_rejected() {
    let a = make_transport(loopback(1)).await;
    let b = make_transport(loopback(2)).await;

    let (dialed, event) = tokio::join!(a.dial(b.node_addr(), Protocol::P2p), next_event(&b));
    assert!(dialed.is_err());
    assert!(matches!(event, AcceptEvent::Rejected { .. }));
}

#[tokio::test]
async fn unserved_protocol_is_rejected() {
    let a = make_transport(loopback(1)).await;
    let b = make_transport(loopback(1).with_served_protocols(vec![Protocol::P2p])).await;

    let (dialed, event) = tokio::join!(a.dial(b.node_addr(), Protocol::Bootnode), next_event(&b));
    assert!(matches!(dialed, Err(TransportError::ProtocolRefused { .. })));
    assert!(matches!(event, AcceptEvent::Rejected { .. }));
}

// ========== Admission Control Tests ==========

#[tokio::test]
async fn identity_limit_rejects_second_connection() {
    let key = StaticKey::generate();
    let a = P2pTransport::bind(loopback(1), key.clone()).await.expect("bind");
    let a2 = P2pTransport::bind(loopback(1), key).await.expect("bind");
    let b = make_transport(loopback(1)).await;

    let (first, event) = tokio::join!(a.dial(b.node_addr(), Protocol::P2p), next_event(&b));
    let _first = first.expect("first dial");
    let AcceptEvent::Accepted(_held) = event else {
        panic!("first connection should be accepted");
    };

    let (second, event) = tokio::join!(a2.dial(b.node_addr(), Protocol::P2p), next_event(&b));
    assert!(second.is_err());
    assert!(matches!(event, AcceptEvent::Rejected { .. }));
}

#[tokio::test]
async fn origin_limit_rejects_before_handshake() {
    let a = make_transport(loopback(1)).await;
    let c = make_transport(loopback(1)).await;
    let b = make_transport(loopback(1).with_origin_limit(1)).await;

    let (first, event) = tokio::join!(a.dial(b.node_addr(), Protocol::P2p), next_event(&b));
    let _first = first.expect("first dial");
    let AcceptEvent::Accepted(_held) = event else {
        panic!("first connection should be accepted");
    };
    assert_eq!(b.listener().limiter().total(), 1);

    let (second, event) = tokio::join!(c.dial(b.node_addr(), Protocol::P2p), next_event(&b));
    assert!(second.is_err());
    assert!(matches!(event, AcceptEvent::Rejected { .. }));
}

#[tokio::test]
async fn closing_connection_releases_admission_slot() {
    let a = make_transport(loopback(1)).await;
    let b = make_transport(loopback(1).with_origin_limit(1)).await;

    let (first, event) = tokio::join!(a.dial(b.node_addr(), Protocol::P2p), next_event(&b));
    let first = first.expect("first dial");
    let AcceptEvent::Accepted(held) = event else {
        panic!("first connection should be accepted");
    };
    held.close();
    drop(held);
    drop(first);

    tokio::time::timeout(WAIT, async {
        while b.listener().limiter().total() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot released");

    let (again, accepted) = tokio::join!(
        a.dial(b.node_addr(), Protocol::P2p),
        tokio::time::timeout(WAIT, b.accept())
    );
    assert!(again.is_ok());
    assert!(accepted.is_ok());
}

#[tokio::test]
async fn closed_transport_refuses_dial() {
    let a = make_transport(loopback(1)).await;
    let b = make_transport(loopback(1)).await;
    a.close();
    assert!(a.is_closed());
    assert!(matches!(
        a.dial(b.node_addr(), Protocol::P2p).await,
        Err(TransportError::Closed)
    ));
    assert!(matches!(a.accept().await, Err(TransportError::Closed)));
}
