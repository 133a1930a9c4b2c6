//! Tests for the peer manager over loopback TCP.

use super::*;
use crate::config::DiscoveryIntervals;
use crate::handler::NullHandler;
use peerlink_transport::TransportConfig;
use std::time::Duration;

const CHAIN: u32 = 0x0000_beef;
const WAIT: Duration = Duration::from_secs(5);

fn make_config() -> PeeringConfig {
    PeeringConfig::default()
        .with_transport(
            TransportConfig::default()
                .with_chain_id(CHAIN)
                .with_origin_limit(16),
        )
        .with_peer_limits(1, 8)
        .with_intervals(DiscoveryIntervals::uniform(Duration::from_secs(3600)))
}

async fn make_manager(config: PeeringConfig) -> PeerManager {
    let manager = PeerManager::bind(config, StaticKey::generate(), Arc::new(NullHandler))
        .await
        .expect("bind");
    manager.start();
    manager
}

fn make_addr(chain_id: u32) -> NodeAddress {
    NodeAddress::new(chain_id, StaticKey::generate().identity(), "127.0.0.1", 1)
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ========== Status Tests ==========

#[test]
fn status_line_format() {
    let status = PeerStatus {
        max: 24,
        active: 2,
        min: 3,
        inactive: 5,
    };
    assert_eq!(status.to_string(), "24/2/3/5");
}

#[tokio::test]
async fn bind_rejects_invalid_config() {
    let config = make_config().with_peer_limits(9, 2);
    let err = PeerManager::bind(config, StaticKey::generate(), Arc::new(NullHandler))
        .await
        .expect_err("min above max");
    assert!(matches!(err, PeeringError::Config(_)));
}

// ========== Directory Tests ==========

#[tokio::test]
async fn add_known_peer_filters_candidates() {
    let manager = make_manager(make_config()).await;

    assert!(!manager.add_known_peer(manager.node_addr().clone()));
    assert!(!manager.add_known_peer(make_addr(CHAIN + 1)));
    assert!(manager.add_known_peer(make_addr(CHAIN)));
    assert_eq!(manager.counts(), PeerCounts { active: 0, inactive: 1 });
    manager.close();
}

#[tokio::test]
async fn firewall_mode_shares_no_peers() {
    let config = make_config().with_firewall_host(make_addr(CHAIN));
    let manager = PeerManager::bind(config, StaticKey::generate(), Arc::new(NullHandler))
        .await
        .expect("bind");
    manager.add_known_peer(make_addr(CHAIN));

    assert!(manager.get_peers(&make_addr(CHAIN).identity()).is_empty());
    manager.close();
}

// ========== Connection Tests ==========

#[tokio::test]
async fn dialing_self_is_refused() {
    let manager = make_manager(make_config()).await;
    let err = manager
        .connect(&manager.node_addr().clone())
        .await
        .expect_err("self");
    assert!(matches!(err, PeeringError::Protocol(_)));
    manager.close();
}

#[tokio::test]
async fn connect_registers_peer_on_both_sides() {
    let a = make_manager(make_config()).await;
    let b = make_manager(make_config()).await;

    a.connect(b.node_addr()).await.expect("connect");
    wait_for("b to see a", || b.counts().active == 1).await;

    assert_eq!(a.counts().active, 1);
    let info = a.active_peers();
    assert_eq!(info.len(), 1);
    assert!(info[0].outbound);
    assert!(!b.active_peers()[0].outbound);

    a.connect(b.node_addr()).await.expect("already connected");
    assert_eq!(a.counts().active, 1);

    a.close();
    b.close();
}

#[tokio::test]
async fn get_peers_never_returns_requester() {
    let a = make_manager(make_config()).await;
    let b = make_manager(make_config()).await;
    let c = make_addr(CHAIN);
    b.add_known_peer(c.clone());

    a.connect(b.node_addr()).await.expect("connect");
    let lease = a.lease(&b.node_addr().identity()).expect("lease on b");
    let response = lease.call(PeerRequest::GetPeers).await.expect("get_peers");

    assert_eq!(
        response,
        PeerResponse::GetPeers(GetPeersResponse {
            peers: vec![c.to_string()],
        })
    );
    assert!(!a.get_peers(&b.node_addr().identity()).contains(b.node_addr()));
    assert!(b.get_peers(&a.node_addr().identity()).iter().all(|p| p != a.node_addr()));

    a.close();
    b.close();
}

#[tokio::test]
async fn silent_discovery_dialer_is_disconnected() {
    let config = make_config()
        .with_peer_limits(1, 1)
        .with_msg_timeout(Duration::from_millis(200))
        .with_discovery_linger(Duration::from_millis(100));
    let a = make_manager(config).await;
    let silent = P2pTransport::bind(
        TransportConfig::default().with_chain_id(CHAIN),
        StaticKey::generate(),
    )
    .await
    .expect("bind");

    let mut conn = silent
        .dial(a.node_addr(), Protocol::Discovery)
        .await
        .expect("dial");
    let read = tokio::time::timeout(WAIT, conn.read_message())
        .await
        .expect("server hung up in time");
    assert!(read.is_err());
    assert_eq!(a.counts().inactive, 0);
    wait_for("slot release", || a.transport().listener().limiter().total() == 0).await;

    let b = make_manager(make_config()).await;
    b.connect(a.node_addr()).await.expect("slot released");
    wait_for("a to see b", || a.counts().active == 1).await;

    silent.close();
    a.close();
    b.close();
}

#[tokio::test]
async fn requests_without_handler_are_unavailable() {
    let a = make_manager(make_config()).await;
    let b = make_manager(make_config()).await;
    a.connect(b.node_addr()).await.expect("connect");

    let err = a
        .client()
        .request(
            PeerRequest::GetBlockHeaders(crate::message::Payload::new(vec![1])),
            crate::client::CallOptions::blocking(WAIT),
        )
        .await
        .expect_err("null handler");
    assert!(matches!(
        err,
        crate::error::CallError::Remote(crate::error::RemoteError::Unavailable(_))
    ));

    a.close();
    b.close();
}

#[tokio::test]
async fn close_disconnects_peers() {
    let a = make_manager(make_config()).await;
    let b = make_manager(make_config()).await;
    a.connect(b.node_addr()).await.expect("connect");
    wait_for("b to see a", || b.counts().active == 1).await;

    a.close();
    tokio::time::timeout(WAIT, a.closed()).await.expect("a closed");
    assert!(a.is_closed());
    wait_for("b to drop a", || b.counts().active == 0).await;

    assert!(matches!(
        a.connect(b.node_addr()).await,
        Err(PeeringError::Closed)
    ));
    b.close();
}

#[tokio::test]
async fn peering_completes_at_minimum() {
    let config = make_config().with_intervals(DiscoveryIntervals::uniform(Duration::from_millis(50)));
    let a = make_manager(config).await;
    let b = make_manager(make_config()).await;
    assert!(!a.peering_complete());

    a.connect(b.node_addr()).await.expect("connect");
    wait_for("peering complete", || a.peering_complete()).await;

    a.close();
    b.close();
}
