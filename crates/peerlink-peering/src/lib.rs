//! # peerlink-peering
//!
//! Peer management for peerlink validator nodes, built on
//! `peerlink-transport`.
//!
//! This crate provides:
//!
//! - A directory of active peers (live multiplexed connections) and
//!   inactive peers (dial candidates with a cool-down after use)
//! - Discovery loops that dial candidates, pull peer lists, keep a firewall
//!   relay connected and fall back to boot nodes
//! - A per-peer dispatch bus whose request worker pool grows on success and
//!   shrinks, then backs off, on timeouts
//! - A per-peer deduplicated gossip queue keyed by a per-process secret
//! - Request/response and gossip framing over the two sub-streams of each
//!   connection
//!
//! ## Core Types
//!
//! - [`PeerManager`]: owns the transport and every peer connection
//! - [`PeerClient`]: load-balanced requests and gossip broadcast
//! - [`PeerLease`]: direct access to one active peer
//! - [`RequestHandler`]: implemented by the application to serve peers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peerlink_peering::{NullHandler, PeerManager, PeeringConfig};
//! use peerlink_transport::StaticKey;
//!
//! let manager = PeerManager::bind(PeeringConfig::default(), StaticKey::generate(), Arc::new(NullHandler)).await?;
//! manager.start();
//! println!("{}", manager.status());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod active;
pub mod bootnode;
pub mod bus;
pub mod caller;
pub mod client;
pub mod config;
mod discovery;
pub mod error;
pub mod handler;
pub mod inactive;
pub mod lease;
pub mod manager;
pub mod message;
pub mod msgq;
pub mod peer;
pub mod queue;
pub mod rpc;

pub use active::{ActiveEntry, ActivePeerStore};
pub use bootnode::{
    DiscoveryRequest, DiscoveryResponse, query_known_nodes, query_peers, serve_known_nodes,
};
pub use bus::{BusSnapshot, CallOutcome, Oversight, OversightAction, PeerBus, RequestItem};
pub use caller::{BoxFuture, PeerCaller};
pub use client::{CallOptions, PeerClient};
pub use config::{
    BusConfig, DEFAULT_PEER_LIMIT_MAX, DEFAULT_PEER_LIMIT_MIN, DiscoveryIntervals,
    OversightConfig, PeeringConfig, QueueConfig,
};
pub use error::{CallError, HandlerError, PeeringError, PeeringResult, RemoteError};
pub use handler::{NullHandler, RequestHandler};
pub use inactive::InactivePeerStore;
pub use lease::PeerLease;
pub use manager::{PeerCounts, PeerManager, PeerStatus};
pub use message::{
    GetPeersResponse, GossipClass, GossipMessage, Payload, PeerRequest, PeerResponse,
};
pub use msgq::{DedupKey, DeliverFn, MsgQueue};
pub use peer::{ActivePeer, PeerInfo};
pub use queue::{PushError, SharedQueue};
pub use rpc::RpcClient;
