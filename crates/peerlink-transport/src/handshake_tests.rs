//! Tests for the three-act handshake.

use super::*;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

async fn run_pair(
    initiator_key: StaticKey,
    target: NodeIdentity,
    responder_key: StaticKey,
) -> (TransportResult<SessionKeys>, TransportResult<SessionKeys>) {
    let (mut a, mut b) = tokio::io::duplex(1024);
    tokio::join!(
        initiate(&mut a, initiator_key, target, DEADLINE),
        respond(&mut b, responder_key, DEADLINE),
    )
}

// ========== In-Memory Act Tests ==========

#[test]
fn acts_have_wire_sizes() {
    assert_eq!(ACT_ONE_SIZE, 50);
    assert_eq!(ACT_TWO_SIZE, 50);
    assert_eq!(ACT_THREE_SIZE, 66);
}

#[test]
fn acts_derive_matching_keys() {
    let alice = StaticKey::generate();
    let bob = StaticKey::generate();

    let mut initiator = InitiatorHandshake::new(alice.clone(), bob.identity()).expect("init");
    let mut responder = ResponderHandshake::new(bob);

    let one = initiator.act_one().expect("act one");
    responder.recv_act_one(&one).expect("recv act one");
    let two = responder.act_two().expect("act two");
    initiator.recv_act_two(&two).expect("recv act two");
    let (three, mut init_keys) = initiator.act_three().expect("act three");
    let mut resp_keys = responder.recv_act_three(&three).expect("recv act three");

    assert_eq!(resp_keys.remote, alice.identity());

    let sealed = init_keys.send.encrypt(b"ping").expect("encrypt");
    assert_eq!(resp_keys.recv.decrypt(&sealed).expect("decrypt"), b"ping");
    let sealed = resp_keys.send.encrypt(b"pong").expect("encrypt");
    assert_eq!(init_keys.recv.decrypt(&sealed).expect("decrypt"), b"pong");
}

#[test]
fn tampered_act_one_is_rejected() {
    let bob = StaticKey::generate();
    let mut initiator =
        InitiatorHandshake::new(StaticKey::generate(), bob.identity()).expect("init");
    let mut one = initiator.act_one().expect("act one");
    one[ACT_ONE_SIZE - 1] ^= 0xff;

    let mut responder = ResponderHandshake::new(bob);
    assert!(matches!(
        responder.recv_act_one(&one),
        Err(TransportError::Handshake(_))
    ));
}

#[test]
fn unknown_version_is_rejected() {
    let bob = StaticKey::generate();
    let mut initiator =
        InitiatorHandshake::new(StaticKey::generate(), bob.identity()).expect("init");
    let mut one = initiator.act_one().expect("act one");
    one[0] = 1;
    let mut responder = ResponderHandshake::new(bob);
    assert!(responder.recv_act_one(&one).is_err());
}

#[test]
fn keys_survive_rotation() {
    let alice = StaticKey::generate();
    let bob = StaticKey::generate();
    let mut initiator = InitiatorHandshake::new(alice, bob.identity()).expect("init");
    let mut responder = ResponderHandshake::new(bob);
    let one = initiator.act_one().expect("act one");
    responder.recv_act_one(&one).expect("recv act one");
    let two = responder.act_two().expect("act two");
    initiator.recv_act_two(&two).expect("recv act two");
    let (three, mut init_keys) = initiator.act_three().expect("act three");
    let mut resp_keys = responder.recv_act_three(&three).expect("recv act three");

    for i in 0..2_500u32 {
        let sealed = init_keys.send.encrypt(&i.to_be_bytes()).expect("encrypt");
        let opened = resp_keys.recv.decrypt(&sealed).expect("decrypt");
        assert_eq!(opened, i.to_be_bytes());
    }
}

#[test]
fn seal_message_rejects_oversized_body() {
    let mut state = CipherState::new([7u8; 32], [9u8; 32]);
    let body = vec![0u8; MAX_MESSAGE_LEN + 1];
    assert!(matches!(
        state.seal_message(&body),
        Err(TransportError::MessageTooLarge(_))
    ));
}

// ========== Stream Tests ==========

#[tokio::test]
async fn handshake_over_stream_authenticates_both_sides() {
    let alice = StaticKey::generate();
    let bob = StaticKey::generate();
    let (a, b) = run_pair(alice.clone(), bob.identity(), bob.clone()).await;
    let a = a.expect("initiator");
    let b = b.expect("responder");
    assert_eq!(a.remote, bob.identity());
    assert_eq!(b.remote, alice.identity());
}

#[tokio::test(start_paused = true)]
async fn handshake_to_wrong_identity_fails() {
    let alice = StaticKey::generate();
    let bob = StaticKey::generate();
    let mallory = StaticKey::generate();

    let (a, b) = tokio::time::timeout(
        Duration::from_secs(10),
        run_pair(alice, mallory.identity(), bob),
    )
    .await
    .expect("no hang");
    assert!(b.is_err());
    assert!(a.is_err());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_hits_read_deadline() {
    let (_a, mut b) = tokio::io::duplex(1024);
    let result = respond(&mut b, StaticKey::generate(), DEADLINE).await;
    assert!(matches!(result, Err(TransportError::HandshakeTimeout)));
}
