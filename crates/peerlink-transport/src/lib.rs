//! # peerlink-transport
//!
//! Authenticated, encrypted peer connections for peerlink nodes.
//!
//! This crate provides:
//!
//! - A three-act secp256k1 handshake producing an encrypted channel bound to
//!   the remote node's long-term key
//! - Protocol negotiation (chain id, listening port, version, sub-protocol)
//! - Inbound admission control by total count, origin IP and identity
//! - A stream multiplexer giving each connection one client and one server
//!   sub-stream
//! - Optional UPnP port mapping (`upnp` feature)
//!
//! ## Core Types
//!
//! - [`NodeAddress`]: `chain|pubkey@host:port` peer address
//! - [`P2pTransport`]: dials and accepts [`P2pConn`]s
//! - [`Multiplexer`]: turns a [`P2pConn`] into a [`MuxConn`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod limiter;
pub mod listener;
pub mod mux;
pub mod negotiate;
pub mod transport;
pub mod types;
#[cfg(feature = "upnp")]
pub mod upnp;

pub use address::NodeAddress;
pub use channel::SecureChannel;
pub use config::TransportConfig;
pub use error::{AddressError, TransportError, TransportResult};
pub use identity::{NodeIdentity, StaticKey};
pub use limiter::{AdmissionLimits, ConnectionLimiter};
pub use listener::AcceptEvent;
pub use mux::{MuxConn, MuxHandle, MuxState, Multiplexer, SubStream, session_role};
pub use transport::{P2pConn, P2pTransport};
pub use types::{Initiator, PROTOCOL_VERSION, Protocol};
#[cfg(feature = "upnp")]
pub use upnp::PortMapping;
