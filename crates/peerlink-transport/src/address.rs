//! Node addresses.
//!
//! The canonical string form is
//! `<8 hex chain id>|<66 hex compressed pubkey>@host:port`.
//! Chain id and identity are authoritative; host and port are only used to
//! dial.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddressError;
use crate::identity::{IDENTITY_HEX_LEN, NodeIdentity};

/// A dialable, identity-bound peer address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    chain_id: u32,
    identity: NodeIdentity,
    host: String,
    port: u16,
}

impl NodeAddress {
    /// Creates a new address.
    #[must_use]
    pub fn new(chain_id: u32, identity: NodeIdentity, host: impl Into<String>, port: u16) -> Self {
        Self {
            chain_id,
            identity,
            host: host.into(),
            port,
        }
    }

    /// Builds an address from a socket address.
    #[must_use]
    pub fn from_socket(chain_id: u32, identity: NodeIdentity, addr: SocketAddr) -> Self {
        Self::new(chain_id, identity, addr.ip().to_string(), addr.port())
    }

    /// Chain identifier.
    #[must_use]
    pub const fn chain_id(&self) -> u32 {
        self.chain_id
    }

    /// Node identity.
    #[must_use]
    pub const fn identity(&self) -> NodeIdentity {
        self.identity
    }

    /// Advisory host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Advisory port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the `host:port` pair, bracketing IPv6 hosts.
    #[must_use]
    pub fn host_port(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Returns a copy with a different port.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Returns true if both addresses name the same node.
    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}|{}@{}",
            self.chain_id,
            self.identity,
            join_host_port(&self.host, self.port)
        )
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeAddress({:08x}|{}@{})",
            self.chain_id,
            self.identity.short(),
            self.host_port()
        )
    }
}

impl FromStr for NodeAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chain_parts: Vec<&str> = s.split('|').collect();
        let [chain_hex, rest] = chain_parts.as_slice() else {
            return Err(AddressError::ChainSeparator(s.to_string()));
        };
        let chain_id = parse_chain_id(chain_hex)?;

        let addr_parts: Vec<&str> = rest.split('@').collect();
        let [key_hex, host_port] = addr_parts.as_slice() else {
            return Err(AddressError::AddressSeparator(s.to_string()));
        };
        if key_hex.len() != IDENTITY_HEX_LEN {
            return Err(AddressError::PublicKeyLength(key_hex.len()));
        }
        let identity: NodeIdentity = key_hex.parse()?;
        let (host, port) = split_host_port(host_port)?;

        Ok(Self {
            chain_id,
            identity,
            host,
            port,
        })
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_chain_id(s: &str) -> Result<u32, AddressError> {
    if s.is_empty() || s.len() > 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AddressError::InvalidChainId(s.to_string()));
    }
    u32::from_str_radix(s, 16).map_err(|_| AddressError::InvalidChainId(s.to_string()))
}

/// Splits `host:port`, accepting `[v6]:port`.
pub fn split_host_port(s: &str) -> Result<(String, u16), AddressError> {
    let invalid = || AddressError::InvalidHostPort(s.to_string());

    let (host, port) = if let Some(stripped) = s.strip_prefix('[') {
        let end = stripped.find(']').ok_or_else(invalid)?;
        let host = &stripped[..end];
        let port = stripped[end + 1..].strip_prefix(':').ok_or_else(invalid)?;
        if host.contains('[') || host.contains(']') {
            return Err(invalid());
        }
        (host, port)
    } else {
        let idx = s.rfind(':').ok_or_else(invalid)?;
        let host = &s[..idx];
        if host.contains(':') || host.contains('[') || host.contains(']') {
            return Err(invalid());
        }
        (host, &s[idx + 1..])
    };

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Joins a host and port, bracketing hosts that contain a colon.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
#[path = "address_tests.rs"]
mod tests;
