//! Peering configuration.
//!
//! Covers peer limits, firewall mode, boot nodes, discovery intervals,
//! bus sizing with its oversight thresholds, and queue sizing. Loadable
//! from JSON.

use std::path::Path;
use std::time::Duration;

use peerlink_transport::config::duration_millis;
use peerlink_transport::{NodeAddress, Protocol, TransportConfig};
use serde::{Deserialize, Serialize};

use crate::error::{PeeringError, PeeringResult};

/// Default minimum active peers for peering to count as complete.
pub const DEFAULT_PEER_LIMIT_MIN: usize = 3;
/// Default maximum active peers.
pub const DEFAULT_PEER_LIMIT_MAX: usize = 24;

/// Periods of the discovery and maintenance loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryIntervals {
    /// Dial a random inactive peer.
    #[serde(with = "duration_millis")]
    pub dial_inactive: Duration,
    /// Pull a peer list from a random active peer.
    #[serde(with = "duration_millis")]
    pub get_peers: Duration,
    /// Re-dial the firewall host.
    #[serde(with = "duration_millis")]
    pub firewall: Duration,
    /// Query a boot node when starved.
    #[serde(with = "duration_millis")]
    pub bootnode: Duration,
    /// Recompute peering status.
    #[serde(with = "duration_millis")]
    pub status: Duration,
}

impl Default for DiscoveryIntervals {
    fn default() -> Self {
        Self {
            dial_inactive: Duration::from_secs(13),
            get_peers: Duration::from_secs(17),
            firewall: Duration::from_secs(10),
            bootnode: Duration::from_secs(31),
            status: Duration::from_secs(3),
        }
    }
}

impl DiscoveryIntervals {
    /// Uses one period for every loop.
    #[must_use]
    pub const fn uniform(period: Duration) -> Self {
        Self {
            dial_inactive: period,
            get_peers: period,
            firewall: period,
            bootnode: period,
            status: period,
        }
    }
}

/// Thresholds for the request worker oversight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OversightConfig {
    /// Consecutive net outcomes, per worker, before the pool is resized.
    pub hysteresis: u32,
    /// Highest backoff level. A timeout at this level closes the peer.
    pub backoff_cap: u32,
    /// Sleep per backoff level once the pool has shrunk to zero.
    #[serde(with = "duration_millis")]
    pub backoff_step: Duration,
}

impl Default for OversightConfig {
    fn default() -> Self {
        Self {
            hysteresis: 2,
            backoff_cap: 10,
            backoff_step: Duration::from_secs(2),
        }
    }
}

/// Worker counts of one peer's dispatch bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Request workers started with the bus.
    pub initial_request_workers: usize,
    /// Upper bound on request workers.
    pub max_request_workers: usize,
    /// Delivery workers of the consensus gossip queue.
    pub gossip_workers: usize,
    /// Delivery workers of the transaction gossip queue.
    pub tx_gossip_workers: usize,
    /// Pool resizing thresholds.
    pub oversight: OversightConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            initial_request_workers: 2,
            max_request_workers: 256,
            gossip_workers: 5,
            tx_gossip_workers: 16,
            oversight: OversightConfig::default(),
        }
    }
}

/// Sizes of the shared work queues and the per-peer gossip queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hashes remembered by each per-peer gossip queue.
    pub capacity: usize,
    /// Shared request backlog. Zero uses the peer limit maximum.
    pub request_backlog: usize,
    /// Shared consensus gossip backlog.
    pub gossip_backlog: usize,
    /// Shared transaction gossip backlog. Zero uses half the gap between
    /// the peer limits.
    pub tx_gossip_backlog: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            request_backlog: 0,
            gossip_backlog: 8,
            tx_gossip_backlog: 0,
        }
    }
}

/// Configuration for a [`crate::PeerManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeeringConfig {
    /// Listener and dial settings.
    pub transport: TransportConfig,
    /// Active peers needed for peering to be complete.
    pub peer_limit_min: usize,
    /// Active peers above which no new peers are dialed.
    pub peer_limit_max: usize,
    /// Only peer with the firewall host and never hand out addresses.
    pub firewall_mode: bool,
    /// Relay host dialed in firewall mode.
    pub firewall_host: Option<NodeAddress>,
    /// Bootstrap nodes queried when no peers are known.
    pub boot_nodes: Vec<NodeAddress>,
    /// Map the listening port on the local gateway.
    pub upnp: bool,
    /// Per-call timeout for remote operations.
    #[serde(with = "duration_millis")]
    pub msg_timeout: Duration,
    /// Deadline for binding the multiplexer on a new connection.
    #[serde(with = "duration_millis")]
    pub mux_bind_timeout: Duration,
    /// How long a served discovery connection stays open.
    #[serde(with = "duration_millis")]
    pub discovery_linger: Duration,
    /// Deadline for a boot node query.
    #[serde(with = "duration_millis")]
    pub bootnode_timeout: Duration,
    /// Discovery loop periods.
    pub intervals: DiscoveryIntervals,
    /// Per-peer bus sizing.
    pub bus: BusConfig,
    /// Queue sizing.
    pub queue: QueueConfig,
}

impl Default for PeeringConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            peer_limit_min: DEFAULT_PEER_LIMIT_MIN,
            peer_limit_max: DEFAULT_PEER_LIMIT_MAX,
            firewall_mode: false,
            firewall_host: None,
            boot_nodes: Vec::new(),
            upnp: false,
            msg_timeout: Duration::from_secs(4),
            mux_bind_timeout: Duration::from_secs(5),
            discovery_linger: Duration::from_secs(7),
            bootnode_timeout: Duration::from_secs(11),
            intervals: DiscoveryIntervals::default(),
            bus: BusConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl PeeringConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> PeeringResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PeeringError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parses configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> PeeringResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| PeeringError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> PeeringResult<()> {
        if self.peer_limit_max == 0 {
            return Err(PeeringError::Config(
                "peer_limit_max must be greater than 0".to_string(),
            ));
        }
        if self.peer_limit_min > self.peer_limit_max {
            return Err(PeeringError::Config(format!(
                "peer_limit_min ({}) exceeds peer_limit_max ({})",
                self.peer_limit_min, self.peer_limit_max
            )));
        }
        if self.firewall_mode && self.firewall_host.is_none() {
            return Err(PeeringError::Config(
                "firewall_mode requires firewall_host".to_string(),
            ));
        }
        if self.msg_timeout.is_zero() {
            return Err(PeeringError::Config(
                "msg_timeout must be greater than 0".to_string(),
            ));
        }
        if self.bus.initial_request_workers == 0
            || self.bus.initial_request_workers > self.bus.max_request_workers
        {
            return Err(PeeringError::Config(format!(
                "bus.initial_request_workers must be in 1..={}",
                self.bus.max_request_workers
            )));
        }
        if self.bus.gossip_workers == 0 || self.bus.tx_gossip_workers == 0 {
            return Err(PeeringError::Config(
                "gossip worker counts must be greater than 0".to_string(),
            ));
        }
        if self.bus.oversight.hysteresis == 0 {
            return Err(PeeringError::Config(
                "bus.oversight.hysteresis must be greater than 0".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(PeeringError::Config(
                "queue.capacity must be greater than 0".to_string(),
            ));
        }
        let chain_id = self.transport.chain_id;
        let foreign = self
            .boot_nodes
            .iter()
            .chain(self.firewall_host.iter())
            .find(|addr| addr.chain_id() != chain_id);
        if let Some(addr) = foreign {
            return Err(PeeringError::Config(format!(
                "address {addr} is not on chain {chain_id:08x}"
            )));
        }
        Ok(())
    }

    /// Sets the transport configuration.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the peer limits.
    #[must_use]
    pub const fn with_peer_limits(mut self, min: usize, max: usize) -> Self {
        self.peer_limit_min = min;
        self.peer_limit_max = max;
        self
    }

    /// Enables firewall mode with the given relay host.
    #[must_use]
    pub fn with_firewall_host(mut self, host: NodeAddress) -> Self {
        self.firewall_mode = true;
        self.firewall_host = Some(host);
        self
    }

    /// Sets the boot nodes.
    #[must_use]
    pub fn with_boot_nodes(mut self, nodes: Vec<NodeAddress>) -> Self {
        self.boot_nodes = nodes;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_msg_timeout(mut self, timeout: Duration) -> Self {
        self.msg_timeout = timeout;
        self
    }

    /// Sets the discovery intervals.
    #[must_use]
    pub const fn with_intervals(mut self, intervals: DiscoveryIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Sets the discovery linger.
    #[must_use]
    pub const fn with_discovery_linger(mut self, linger: Duration) -> Self {
        self.discovery_linger = linger;
        self
    }

    /// Sets the bus configuration.
    #[must_use]
    pub const fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Transport configuration actually used by the manager: accepted
    /// connections capped at the peer maximum, serving peer sessions and
    /// discovery.
    #[must_use]
    pub fn effective_transport(&self) -> TransportConfig {
        self.transport
            .clone()
            .with_total_limit(self.peer_limit_max)
            .with_served_protocols(vec![Protocol::P2p, Protocol::Discovery])
    }

    /// Capacity of the shared request queue.
    #[must_use]
    pub const fn request_backlog(&self) -> usize {
        if self.queue.request_backlog == 0 {
            self.peer_limit_max
        } else {
            self.queue.request_backlog
        }
    }

    /// Capacity of the shared consensus gossip queue.
    #[must_use]
    pub const fn gossip_backlog(&self) -> usize {
        if self.queue.gossip_backlog == 0 {
            1
        } else {
            self.queue.gossip_backlog
        }
    }

    /// Capacity of the shared transaction gossip queue.
    #[must_use]
    pub const fn tx_gossip_backlog(&self) -> usize {
        if self.queue.tx_gossip_backlog != 0 {
            return self.queue.tx_gossip_backlog;
        }
        let derived = self.peer_limit_max.saturating_sub(self.peer_limit_min) / 2;
        if derived == 0 { 1 } else { derived }
    }
}
