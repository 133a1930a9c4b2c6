//! Error types for peerlink-transport.

use std::net::IpAddr;

use thiserror::Error;

/// Errors produced while parsing a node address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The string does not contain exactly one `|` separator.
    #[error("missing or repeated chain separator '|' in {0:?}")]
    ChainSeparator(String),

    /// The chain identifier is not an 8 character hex u32.
    #[error("invalid chain identifier {0:?}")]
    InvalidChainId(String),

    /// The remainder does not contain exactly one `@` separator.
    #[error("missing or repeated address separator '@' in {0:?}")]
    AddressSeparator(String),

    /// The public key hex has the wrong length.
    #[error("public key must be 66 hex characters, got {0}")]
    PublicKeyLength(usize),

    /// The public key hex does not decode to a valid secp256k1 point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The host:port component could not be parsed.
    #[error("invalid host:port {0:?}")]
    InvalidHostPort(String),
}

/// Errors that can occur while establishing or using a secure connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed node address.
    #[error("address error: {0}")]
    Address(#[from] AddressError),

    /// A handshake act was malformed or failed authentication.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A handshake or negotiation read exceeded its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Encrypting or decrypting a transport message failed.
    #[error("cipher failure")]
    Cipher,

    /// A transport message exceeded the maximum length.
    #[error("message of {0} bytes exceeds maximum length")]
    MessageTooLarge(usize),

    /// The peers are on different chains.
    #[error("chain id mismatch: local {local:#010x}, remote {remote:#010x}")]
    ChainIdMismatch {
        /// Local chain identifier.
        local: u32,
        /// Remote chain identifier.
        remote: u32,
    },

    /// The peers speak different protocol versions.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Local version.
        local: u32,
        /// Remote version.
        remote: u32,
    },

    /// The requested sub-protocol is not served by the remote peer.
    #[error("sub-protocol {requested} refused (peer answered {answered})")]
    ProtocolRefused {
        /// Tag requested by the dialer.
        requested: u32,
        /// Tag echoed back by the listener.
        answered: u32,
    },

    /// The remote peer presented an unexpected identity.
    #[error("remote identity mismatch")]
    IdentityMismatch,

    /// An admission limit was exceeded for the given origin.
    #[error("connection from {ip} rejected: {reason}")]
    AdmissionRejected {
        /// Remote IP address.
        ip: IpAddr,
        /// Which limit was hit.
        reason: &'static str,
    },

    /// The multiplexer could not bind both sub-streams in time.
    #[error("multiplexer bind failed: {0}")]
    Mux(String),

    /// Dialing the remote host timed out.
    #[error("dial to {0} timed out")]
    DialTimeout(String),

    /// The listener or connection has been closed.
    #[error("closed")]
    Closed,

    /// Port mapping failed.
    #[error("port mapping failed: {0}")]
    PortMapping(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
