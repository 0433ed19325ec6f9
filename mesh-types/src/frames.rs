//! Transport frames exchanged between two nodes.
//!
//! Frames are MessagePack maps tagged by `type`. On the wire each frame is
//! preceded by a 4-byte big-endian length. Everything after `WELCOME` is
//! sealed with the session key, so a sealed frame costs
//! [`SEAL_OVERHEAD`] bytes more than its plaintext encoding.

use serde::{Deserialize, Serialize};

use crate::{ChatMessage, CircleId, Cursor, MsgId, NodeId, PeerRecord, WireError};

/// Protocol version carried in `HELLO`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum size of a single frame on the wire (excluding the length prefix).
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Bytes added by sealing: 12-byte nonce plus 16-byte GCM tag.
pub const SEAL_OVERHEAD: usize = 12 + 16;

/// Largest plaintext frame that still fits [`MAX_FRAME_SIZE`] once sealed.
pub const MAX_PLAIN_FRAME: usize = MAX_FRAME_SIZE - SEAL_OVERHEAD;

/// All frames of the mesh protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Initiator opens a session
    Hello {
        /// Protocol version
        version: u8,
        /// Initiator node id
        node_id: NodeId,
        /// Circle the initiator wants to sync
        circle_id: CircleId,
        /// Hex of 16 random bytes
        client_nonce: String,
    },
    /// Responder challenges the initiator
    Challenge {
        /// Hex of 16 random bytes
        server_nonce: String,
    },
    /// Initiator proves knowledge of the circle secret
    HelloAuth {
        /// Hex HMAC token
        token: String,
    },
    /// Responder accepts; every later frame is sealed
    Welcome {
        /// Session encryption is active
        enc_ready: bool,
        /// Responder node id
        node_id: NodeId,
    },
    /// Peer exchange chunk
    Peers {
        /// Known peers, sender first
        peers: Vec<PeerRecord>,
        /// Another chunk follows
        #[serde(default)]
        more: bool,
    },
    /// Digest chunk: ids the sender holds
    MsgsHave {
        /// Message ids
        ids: Vec<MsgId>,
        /// Another chunk follows
        more: bool,
    },
    /// Request chunk: ids the sender wants
    MsgsReq {
        /// Message ids
        ids: Vec<MsgId>,
        /// Another chunk follows
        more: bool,
    },
    /// Transfer chunk
    MsgsSend {
        /// Sealed messages
        messages: Vec<ChatMessage>,
        /// Another chunk follows
        more: bool,
    },
    /// Envelopes pushed to an anchor
    AnchorPush {
        /// Sealed v2 messages
        messages: Vec<ChatMessage>,
        /// Another chunk follows
        more: bool,
    },
    /// Anchor acknowledges a push
    AnchorPushAck {
        /// Number of envelopes newly stored
        accepted: u32,
        /// Highest cursor after the push
        cursor: Cursor,
        /// Random id of the anchor store instance; changes when it restarts
        epoch: u64,
    },
    /// Pull stored envelopes after a cursor
    AnchorPull {
        /// Return entries with cursor > since
        since: Cursor,
        /// Maximum entries
        limit: u32,
    },
    /// Anchor pull response chunk
    AnchorMsgs {
        /// Stored envelopes
        messages: Vec<ChatMessage>,
        /// Cursor to resume from
        next_cursor: Cursor,
        /// More entries remain
        more: bool,
        /// Store instance the cursors belong to
        epoch: u64,
    },
    /// Graceful end of session
    Bye {
        /// Optional reason
        reason: Option<String>,
    },
}

impl Frame {
    /// Serialize to MessagePack (named fields).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Frame name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "HELLO",
            Frame::Challenge { .. } => "CHALLENGE",
            Frame::HelloAuth { .. } => "HELLO_AUTH",
            Frame::Welcome { .. } => "WELCOME",
            Frame::Peers { .. } => "PEERS",
            Frame::MsgsHave { .. } => "MSGS_HAVE",
            Frame::MsgsReq { .. } => "MSGS_REQ",
            Frame::MsgsSend { .. } => "MSGS_SEND",
            Frame::AnchorPush { .. } => "ANCHOR_PUSH",
            Frame::AnchorPushAck { .. } => "ANCHOR_PUSH_ACK",
            Frame::AnchorPull { .. } => "ANCHOR_PULL",
            Frame::AnchorMsgs { .. } => "ANCHOR_MSGS",
            Frame::Bye { .. } => "BYE",
        }
    }

    /// Convenience constructor for `BYE`.
    pub fn bye(reason: impl Into<String>) -> Self {
        Frame::Bye {
            reason: Some(reason.into()),
        }
    }
}

/// Split `items` into chunks whose encoded frame stays under `budget` bytes.
///
/// `build(chunk, more)` produces the frame for a chunk. Every chunk holds at
/// least one item, so a single item larger than the budget still travels
/// alone and is rejected by the receiver rather than looping forever.
pub fn chunk_frames<T: Clone + Serialize>(
    items: &[T],
    budget: usize,
    build: impl Fn(Vec<T>, bool) -> Frame,
) -> Result<Vec<Frame>, WireError> {
    if items.is_empty() {
        return Ok(vec![build(Vec::new(), false)]);
    }

    // Empty frame plus worst-case growth of the array length header.
    let base = build(Vec::new(), true).to_bytes()?.len() + 4;

    let mut frames = Vec::new();
    let mut chunk: Vec<T> = Vec::new();
    let mut used = base;
    for item in items {
        let size = rmp_serde::to_vec_named(item)
            .map_err(WireError::Serialization)?
            .len();
        if !chunk.is_empty() && used + size > budget {
            frames.push(build(std::mem::take(&mut chunk), true));
            used = base;
        }
        chunk.push(item.clone());
        used += size;
    }
    frames.push(build(chunk, false));
    Ok(frames)
}
