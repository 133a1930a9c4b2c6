//! Request/response and gossip framing over multiplexed sub-streams.
//!
//! Each connection carries two sub-streams. This node sends requests and
//! gossip on its client stream ([`RpcClient`]) and answers the remote's on
//! its server stream ([`serve`]). Frames are JSON documents inside
//! length-delimited records.

mod client;
mod server;

pub use client::RpcClient;
pub use server::serve;

use bytes::Bytes;
use peerlink_transport::SubStream;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{CallError, RemoteError};
use crate::message::{GossipMessage, PeerRequest, PeerResponse};

/// Largest encoded frame accepted on a sub-stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One record on a sub-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum RpcFrame {
    /// A request expecting a [`RpcFrame::Response`].
    Request {
        /// Correlation id chosen by the sender.
        id: u64,
        /// The request.
        request: PeerRequest,
    },
    /// A gossip message expecting an [`RpcFrame::Ack`].
    Gossip {
        /// Correlation id chosen by the sender.
        id: u64,
        /// The message.
        message: GossipMessage,
    },
    /// Answer to a request.
    Response {
        /// Id of the request.
        id: u64,
        /// The response or the remote's rejection.
        result: Result<PeerResponse, RemoteError>,
    },
    /// Acknowledgement of a gossip message.
    Ack {
        /// Id of the gossip message.
        id: u64,
        /// Acceptance or the remote's rejection.
        result: Result<(), RemoteError>,
    },
}

impl RpcFrame {
    fn encode(&self) -> Result<Bytes, CallError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn decode(raw: &[u8]) -> Result<Self, CallError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

type FramedStream = Framed<SubStream, LengthDelimitedCodec>;

fn framed(stream: SubStream) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(stream, codec)
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
