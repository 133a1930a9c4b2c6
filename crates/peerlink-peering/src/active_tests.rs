//! Tests for the active peer store.

use super::*;
use peerlink_transport::StaticKey;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeConn {
    addr: NodeAddress,
    signal: CancellationToken,
}

impl ActiveEntry for FakeConn {
    fn identity(&self) -> NodeIdentity {
        self.addr.identity()
    }

    fn node_addr(&self) -> &NodeAddress {
        &self.addr
    }

    fn close_signal(&self) -> CancellationToken {
        self.signal.clone()
    }

    fn close(&self) {
        self.signal.cancel();
    }
}

fn make_conn(identity: NodeIdentity) -> FakeConn {
    FakeConn {
        addr: NodeAddress::new(1, identity, "127.0.0.1", 4000),
        signal: CancellationToken::new(),
    }
}

fn make_identity() -> NodeIdentity {
    StaticKey::generate().identity()
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ========== Add Tests ==========

#[tokio::test(start_paused = true)]
async fn duplicate_live_add_is_rejected_and_closed() {
    let store = ActivePeerStore::new(true);
    let id = make_identity();
    let first = make_conn(id);
    let second = make_conn(id);

    assert!(store.add(first.clone()));
    assert!(!store.add(second.clone()));

    assert_eq!(store.len(), 1);
    assert!(second.is_closed());
    assert!(!first.is_closed());
}

#[tokio::test(start_paused = true)]
async fn add_after_close_replaces_entry() {
    let store = ActivePeerStore::new(true);
    let id = make_identity();
    let first = make_conn(id);
    let second = make_conn(id);

    assert!(store.add(first.clone()));
    first.close();
    assert!(store.add(second.clone()));
    assert_eq!(store.len(), 1);

    settle().await;

    // The first entry's cleanup ran after the replacement and must not
    // remove it.
    assert_eq!(store.len(), 1);
    assert!(!store.get(&id).expect("entry").is_closed());
}

#[tokio::test(start_paused = true)]
async fn closed_connection_is_removed() {
    let store = ActivePeerStore::new(true);
    let conn = make_conn(make_identity());
    assert!(store.add(conn.clone()));

    conn.close();
    settle().await;

    assert!(store.is_empty());
    assert!(!store.contains(&conn.identity()));
}

#[tokio::test(start_paused = true)]
async fn add_to_closed_store_is_rejected() {
    let store = ActivePeerStore::new(true);
    store.close();
    let conn = make_conn(make_identity());
    assert!(!store.add(conn.clone()));
    assert!(conn.is_closed());
    assert!(store.is_empty());
}

// ========== Delete Tests ==========

#[tokio::test(start_paused = true)]
async fn del_closes_owned_connection() {
    let store = ActivePeerStore::new(true);
    let conn = make_conn(make_identity());
    store.add(conn.clone());

    let removed = store.del(&conn.identity()).expect("removed");
    assert!(removed.is_closed());
    assert!(store.del(&conn.identity()).is_none());
}

#[tokio::test(start_paused = true)]
async fn del_leaves_unowned_connection_open() {
    let store = ActivePeerStore::new(false);
    let conn = make_conn(make_identity());
    store.add(conn.clone());

    store.del(&conn.identity());
    assert!(!conn.is_closed());
    assert!(store.is_empty());
}

// ========== Query Tests ==========

#[tokio::test(start_paused = true)]
async fn random_picks_stored_entries() {
    let store = ActivePeerStore::new(true);
    assert!(store.random().is_none());

    let conns: Vec<FakeConn> = (0..4).map(|_| make_conn(make_identity())).collect();
    for conn in &conns {
        store.add(conn.clone());
    }

    for _ in 0..32 {
        let picked = store.random().expect("non-empty");
        assert!(conns.iter().any(|c| c.identity() == picked.identity()));
    }
    assert_eq!(store.entries().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn random_except_skips_the_excluded_identity() {
    let store = ActivePeerStore::new(true);
    let only = make_conn(make_identity());
    store.add(only.clone());

    assert!(store.random_except(&only.identity()).is_none());

    let other = make_conn(make_identity());
    store.add(other.clone());
    for _ in 0..16 {
        let picked = store.random_except(&only.identity()).expect("other");
        assert_eq!(picked.identity(), other.identity());
    }
}

// ========== Close Tests ==========

#[tokio::test(start_paused = true)]
async fn close_closes_every_owned_connection() {
    let store = ActivePeerStore::new(true);
    let conns: Vec<FakeConn> = (0..3).map(|_| make_conn(make_identity())).collect();
    for conn in &conns {
        store.add(conn.clone());
    }

    store.close();
    store.close();

    assert!(store.is_closed());
    assert!(store.is_empty());
    assert!(conns.iter().all(FakeConn::is_closed));
}
