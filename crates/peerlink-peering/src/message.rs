//! Remote operations and gossip carried between peers.
//!
//! Payloads are opaque, already-serialized bytes owned by the consensus
//! layer. This crate only routes them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque serialized body of a request, response or gossip message.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(#[serde(with = "hex")] pub Vec<u8>);

impl Payload {
    /// Wraps raw bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// A request answered by exactly one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum PeerRequest {
    /// Chain sync status.
    Status(Payload),
    /// Block headers by height.
    GetBlockHeaders(Payload),
    /// Mined transactions by hash.
    GetMinedTxs(Payload),
    /// Pending transactions by hash.
    GetPendingTxs(Payload),
    /// State trie node during snapshot sync.
    GetSnapshotNode(Payload),
    /// State data during snapshot sync.
    GetSnapshotStateData(Payload),
    /// Header trie node during snapshot sync.
    GetSnapshotHdrNode(Payload),
    /// Peer exchange. Answered by the peering layer itself.
    GetPeers,
}

impl PeerRequest {
    /// Method name for logs.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::GetBlockHeaders(_) => "get_block_headers",
            Self::GetMinedTxs(_) => "get_mined_txs",
            Self::GetPendingTxs(_) => "get_pending_txs",
            Self::GetSnapshotNode(_) => "get_snapshot_node",
            Self::GetSnapshotStateData(_) => "get_snapshot_state_data",
            Self::GetSnapshotHdrNode(_) => "get_snapshot_hdr_node",
            Self::GetPeers => "get_peers",
        }
    }
}

/// Peer list returned by [`PeerRequest::GetPeers`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetPeersResponse {
    /// Canonical node address strings.
    pub peers: Vec<String>,
}

/// The answer to a [`PeerRequest`]. Variants mirror the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum PeerResponse {
    /// Chain sync status.
    Status(Payload),
    /// Block headers.
    GetBlockHeaders(Payload),
    /// Mined transactions.
    GetMinedTxs(Payload),
    /// Pending transactions.
    GetPendingTxs(Payload),
    /// State trie node.
    GetSnapshotNode(Payload),
    /// State data.
    GetSnapshotStateData(Payload),
    /// Header trie node.
    GetSnapshotHdrNode(Payload),
    /// Peer list.
    GetPeers(GetPeersResponse),
}

impl PeerResponse {
    /// Method name for logs.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::GetBlockHeaders(_) => "get_block_headers",
            Self::GetMinedTxs(_) => "get_mined_txs",
            Self::GetPendingTxs(_) => "get_pending_txs",
            Self::GetSnapshotNode(_) => "get_snapshot_node",
            Self::GetSnapshotStateData(_) => "get_snapshot_state_data",
            Self::GetSnapshotHdrNode(_) => "get_snapshot_hdr_node",
            Self::GetPeers(_) => "get_peers",
        }
    }

    /// Returns true if this response is of the kind `request` expects.
    #[must_use]
    pub fn answers(&self, request: &PeerRequest) -> bool {
        self.method() == request.method()
    }
}

/// Traffic class of a gossip message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipClass {
    /// Proposals, votes, round and height changes, block headers.
    Consensus,
    /// Transactions.
    Transaction,
}

/// A broadcast message delivered to every active peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum GossipMessage {
    /// A transaction.
    Transaction(Payload),
    /// A block proposal.
    Proposal(Payload),
    /// A pre-vote.
    PreVote(Payload),
    /// A pre-vote for nil.
    PreVoteNil(Payload),
    /// A pre-commit.
    PreCommit(Payload),
    /// A pre-commit for nil.
    PreCommitNil(Payload),
    /// A next-round message.
    NextRound(Payload),
    /// A next-height message.
    NextHeight(Payload),
    /// A block header.
    BlockHeader(Payload),
}

impl GossipMessage {
    /// Traffic class this message travels in.
    #[must_use]
    pub const fn class(&self) -> GossipClass {
        match self {
            Self::Transaction(_) => GossipClass::Transaction,
            _ => GossipClass::Consensus,
        }
    }

    /// Kind name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Proposal(_) => "proposal",
            Self::PreVote(_) => "pre_vote",
            Self::PreVoteNil(_) => "pre_vote_nil",
            Self::PreCommit(_) => "pre_commit",
            Self::PreCommitNil(_) => "pre_commit_nil",
            Self::NextRound(_) => "next_round",
            Self::NextHeight(_) => "next_height",
            Self::BlockHeader(_) => "block_header",
        }
    }

    const fn tag(&self) -> u8 {
        match self {
            Self::Transaction(_) => 1,
            Self::Proposal(_) => 2,
            Self::PreVote(_) => 3,
            Self::PreVoteNil(_) => 4,
            Self::PreCommit(_) => 5,
            Self::PreCommitNil(_) => 6,
            Self::NextRound(_) => 7,
            Self::NextHeight(_) => 8,
            Self::BlockHeader(_) => 9,
        }
    }

    /// The opaque body.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        match self {
            Self::Transaction(p)
            | Self::Proposal(p)
            | Self::PreVote(p)
            | Self::PreVoteNil(p)
            | Self::PreCommit(p)
            | Self::PreCommitNil(p)
            | Self::NextRound(p)
            | Self::NextHeight(p)
            | Self::BlockHeader(p) => p,
        }
    }

    /// Bytes hashed for deduplication: the kind tag followed by the body.
    #[must_use]
    pub fn dedup_input(&self) -> Vec<u8> {
        let body = self.payload().as_bytes();
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(self.tag());
        out.extend_from_slice(body);
        out
    }
}
