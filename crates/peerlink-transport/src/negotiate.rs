//! Protocol negotiation run immediately after the handshake.
//!
//! Four lock-step exchanges of big-endian `u32` values, one per encrypted
//! message: chain id, listening port, protocol version and sub-protocol tag.
//! The dialer writes then reads, the listener reads then writes. Each side
//! sends its own value before judging the other's, so a mismatch fails both
//! ends the same way. Every read re-arms the deadline.

use std::time::Duration;

use tracing::debug;

use crate::channel::SecureChannel;
use crate::error::{TransportError, TransportResult};
use crate::types::{Initiator, Protocol};

/// Values this node advertises during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalParams {
    /// Chain this node participates in.
    pub chain_id: u32,
    /// Port this node listens on.
    pub port: u16,
    /// Wire protocol version.
    pub version: u32,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Shared chain id.
    pub chain_id: u32,
    /// Listening port advertised by the remote node.
    pub remote_port: u16,
    /// Shared protocol version.
    pub version: u32,
    /// Agreed sub-protocol.
    pub protocol: Protocol,
}

async fn read_u32(channel: &mut SecureChannel, deadline: Duration) -> TransportResult<u32> {
    let msg = tokio::time::timeout(deadline, channel.read_message())
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    let bytes: [u8; 4] = msg
        .as_slice()
        .try_into()
        .map_err(|_| TransportError::Handshake(format!("expected 4 bytes, got {}", msg.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

async fn write_u32(channel: &mut SecureChannel, value: u32) -> TransportResult<()> {
    channel.write_message(&value.to_be_bytes()).await
}

async fn exchange(
    channel: &mut SecureChannel,
    role: Initiator,
    value: u32,
    deadline: Duration,
) -> TransportResult<u32> {
    if role.is_self() {
        write_u32(channel, value).await?;
        read_u32(channel, deadline).await
    } else {
        let remote = read_u32(channel, deadline).await?;
        write_u32(channel, value).await?;
        Ok(remote)
    }
}

async fn exchange_shared(
    channel: &mut SecureChannel,
    role: Initiator,
    local: &LocalParams,
    deadline: Duration,
) -> TransportResult<u16> {
    let remote_chain = exchange(channel, role, local.chain_id, deadline).await?;
    if remote_chain != local.chain_id {
        return Err(TransportError::ChainIdMismatch {
            local: local.chain_id,
            remote: remote_chain,
        });
    }

    let remote_port = exchange(channel, role, u32::from(local.port), deadline).await?;
    let remote_port = u16::try_from(remote_port)
        .map_err(|_| TransportError::Handshake(format!("port {remote_port} out of range")))?;

    let remote_version = exchange(channel, role, local.version, deadline).await?;
    if remote_version != local.version {
        return Err(TransportError::VersionMismatch {
            local: local.version,
            remote: remote_version,
        });
    }
    Ok(remote_port)
}

/// Dialer side: negotiates and requests `protocol`.
pub async fn negotiate_outbound(
    channel: &mut SecureChannel,
    local: &LocalParams,
    protocol: Protocol,
    deadline: Duration,
) -> TransportResult<Negotiated> {
    let remote_port = exchange_shared(channel, Initiator::SelfInitiated, local, deadline).await?;

    let answered = exchange(channel, Initiator::SelfInitiated, protocol.tag(), deadline).await?;
    if answered != protocol.tag() {
        return Err(TransportError::ProtocolRefused {
            requested: protocol.tag(),
            answered,
        });
    }

    debug!(
        remote = %channel.remote_identity().short(),
        protocol = %protocol,
        "Negotiated outbound connection"
    );
    Ok(Negotiated {
        chain_id: local.chain_id,
        remote_port,
        version: local.version,
        protocol,
    })
}

/// Listener side: negotiates and accepts any protocol in `served`.
pub async fn negotiate_inbound(
    channel: &mut SecureChannel,
    local: &LocalParams,
    served: &[Protocol],
    deadline: Duration,
) -> TransportResult<Negotiated> {
    let remote_port = exchange_shared(channel, Initiator::PeerInitiated, local, deadline).await?;

    let requested = read_u32(channel, deadline).await?;
    let accepted = Protocol::from_tag(requested).filter(|p| served.contains(p));
    let answer = accepted.map_or(0, Protocol::tag);
    write_u32(channel, answer).await?;
    let Some(protocol) = accepted else {
        return Err(TransportError::ProtocolRefused {
            requested,
            answered: answer,
        });
    };

    debug!(
        remote = %channel.remote_identity().short(),
        protocol = %protocol,
        "Negotiated inbound connection"
    );
    Ok(Negotiated {
        chain_id: local.chain_id,
        remote_port,
        version: local.version,
        protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{initiate, respond};
    use crate::identity::StaticKey;
    use test_case::test_case;

    const DEADLINE: Duration = Duration::from_secs(5);

    async fn channel_pair() -> (SecureChannel, SecureChannel) {
        let alice = StaticKey::generate();
        let bob = StaticKey::generate();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let (ka, kb) = tokio::join!(
            initiate(&mut a, alice, bob.identity(), DEADLINE),
            respond(&mut b, bob, DEADLINE),
        );
        (
            SecureChannel::new(Box::new(a), ka.expect("initiator")),
            SecureChannel::new(Box::new(b), kb.expect("responder")),
        )
    }

    fn params(chain_id: u32, port: u16, version: u32) -> LocalParams {
        LocalParams {
            chain_id,
            port,
            version,
        }
    }

    #[tokio::test]
    async fn matching_parameters_complete() {
        let (mut a, mut b) = channel_pair().await;
        let dialer = params(7, 4001, 1);
        let listener = params(7, 4002, 1);
        let (out, inb) = tokio::join!(
            negotiate_outbound(&mut a, &dialer, Protocol::P2p, DEADLINE),
            negotiate_inbound(&mut b, &listener, &Protocol::ALL, DEADLINE),
        );
        let out = out.expect("outbound");
        let inb = inb.expect("inbound");
        assert_eq!(out.remote_port, 4002);
        assert_eq!(inb.remote_port, 4001);
        assert_eq!(out.protocol, Protocol::P2p);
        assert_eq!(inb.protocol, Protocol::P2p);
    }

    #[test_case(params(1, 1, 1), params(2, 1, 1) ; "chain id differs")]
    #[test_case(params(1, 1, 1), params(1, 1, 2) ; "version differs")]
    #[tokio::test]
    async fn mismatch_fails_both_sides(dialer: LocalParams, listener: LocalParams) {
        let (mut a, mut b) = channel_pair().await;
        let (out, inb) = tokio::join!(
            negotiate_outbound(&mut a, &dialer, Protocol::P2p, DEADLINE),
            negotiate_inbound(&mut b, &listener, &Protocol::ALL, DEADLINE),
        );
        assert!(out.is_err());
        assert!(inb.is_err());
    }

    #[tokio::test]
    async fn unserved_protocol_fails_both_sides() {
        let (mut a, mut b) = channel_pair().await;
        let dialer = params(1, 1, 1);
        let listener = params(1, 1, 1);
        let (out, inb) = tokio::join!(
            negotiate_outbound(&mut a, &dialer, Protocol::Bootnode, DEADLINE),
            negotiate_inbound(
                &mut b,
                &listener,
                &[Protocol::P2p, Protocol::Discovery],
                DEADLINE
            ),
        );
        assert!(matches!(
            out,
            Err(TransportError::ProtocolRefused { requested: 3, answered: 0 })
        ));
        assert!(matches!(inb, Err(TransportError::ProtocolRefused { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_dialer_times_out() {
        let (_a, mut b) = channel_pair().await;
        let result = negotiate_inbound(&mut b, &params(1, 1, 1), &Protocol::ALL, DEADLINE).await;
        assert!(matches!(result, Err(TransportError::HandshakeTimeout)));
    }
}
