//! Small shared types: sub-protocol tags and connection roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Sub-protocol requested by the dialer during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Full peer-to-peer session (multiplexed request and gossip traffic).
    P2p,
    /// One-shot peer exchange.
    Discovery,
    /// Bootstrap node query.
    Bootnode,
}

impl Protocol {
    /// All known protocols.
    pub const ALL: [Self; 3] = [Self::P2p, Self::Discovery, Self::Bootnode];

    /// Wire tag.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::P2p => 1,
            Self::Discovery => 2,
            Self::Bootnode => 3,
        }
    }

    /// Parses a wire tag.
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::P2p),
            2 => Some(Self::Discovery),
            3 => Some(Self::Bootnode),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::P2p => "p2p",
            Self::Discovery => "discovery",
            Self::Bootnode => "bootnode",
        };
        f.write_str(name)
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initiator {
    /// This node dialed.
    SelfInitiated,
    /// The remote node dialed.
    PeerInitiated,
}

impl Initiator {
    /// Returns true if this node dialed.
    #[must_use]
    pub const fn is_self(self) -> bool {
        matches!(self, Self::SelfInitiated)
    }
}
