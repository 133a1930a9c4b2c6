//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limiter::AdmissionLimits;
use crate::types::{PROTOCOL_VERSION, Protocol};

/// Default number of concurrent accepted connections.
pub const DEFAULT_TOTAL_LIMIT: usize = 16;
/// Default number of concurrent connections per remote IP.
pub const DEFAULT_ORIGIN_LIMIT: usize = 3;
/// Default number of concurrent connections per remote identity.
pub const DEFAULT_IDENTITY_LIMIT: usize = 1;

/// Configuration for a [`crate::P2pTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Host to bind and advertise.
    pub host: String,
    /// Port to bind. Zero picks an ephemeral port.
    pub port: u16,
    /// Chain this node belongs to.
    pub chain_id: u32,
    /// Wire protocol version.
    pub protocol_version: u32,
    /// Total concurrent accepted connections.
    pub total_limit: usize,
    /// Concurrent accepted connections per remote IP.
    pub origin_limit: usize,
    /// Concurrent accepted connections per remote identity.
    pub identity_limit: usize,
    /// Deadline for each handshake and negotiation read.
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,
    /// Deadline for establishing an outbound TCP connection.
    #[serde(with = "duration_millis")]
    pub dial_timeout: Duration,
    /// Sub-protocols served to inbound connections.
    pub served_protocols: Vec<Protocol>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            chain_id: 0,
            protocol_version: PROTOCOL_VERSION,
            total_limit: DEFAULT_TOTAL_LIMIT,
            origin_limit: DEFAULT_ORIGIN_LIMIT,
            identity_limit: DEFAULT_IDENTITY_LIMIT,
            handshake_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            served_protocols: Protocol::ALL.to_vec(),
        }
    }
}

impl TransportConfig {
    /// Sets the bind host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the bind port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the chain id.
    #[must_use]
    pub const fn with_chain_id(mut self, chain_id: u32) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Sets the total accepted connection limit.
    #[must_use]
    pub const fn with_total_limit(mut self, limit: usize) -> Self {
        self.total_limit = limit;
        self
    }

    /// Sets the per-origin limit. Zero falls back to the default.
    #[must_use]
    pub const fn with_origin_limit(mut self, limit: usize) -> Self {
        self.origin_limit = limit;
        self
    }

    /// Sets the handshake deadline.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the served sub-protocols.
    #[must_use]
    pub fn with_served_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.served_protocols = protocols;
        self
    }

    /// Effective admission limits, substituting defaults for zero values.
    #[must_use]
    pub const fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            total: if self.total_limit == 0 {
                DEFAULT_TOTAL_LIMIT
            } else {
                self.total_limit
            },
            per_origin: if self.origin_limit == 0 {
                DEFAULT_ORIGIN_LIMIT
            } else {
                self.origin_limit
            },
            per_identity: if self.identity_limit == 0 {
                DEFAULT_IDENTITY_LIMIT
            } else {
                self.identity_limit
            },
        }
    }
}

/// Serializes [`Duration`] as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize a duration from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_admission_policy() {
        let config = TransportConfig::default();
        let limits = config.admission_limits();
        assert_eq!(limits.total, 16);
        assert_eq!(limits.per_origin, 3);
        assert_eq!(limits.per_identity, 1);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let config = TransportConfig::default()
            .with_origin_limit(0)
            .with_total_limit(0);
        assert_eq!(config.admission_limits().per_origin, DEFAULT_ORIGIN_LIMIT);
        assert_eq!(config.admission_limits().total, DEFAULT_TOTAL_LIMIT);
    }

    #[test]
    fn config_json_roundtrip() {
        let config = TransportConfig::default()
            .with_chain_id(42)
            .with_port(4242)
            .with_served_protocols(vec![Protocol::P2p]);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: TransportConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"chain_id": 9, "handshake_timeout": 250}"#).expect("parse");
        assert_eq!(config.chain_id, 9);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.origin_limit, DEFAULT_ORIGIN_LIMIT);
    }
}
