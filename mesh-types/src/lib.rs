//! # mesh-types
//!
//! Wire format and data model for the circle mesh gossip protocol.
//!
//! This crate provides the types shared by every circle mesh crate:
//! - [`NodeId`], [`CircleId`], [`CircleHint`], [`MsgId`], [`ChannelId`], [`Cursor`] - Identity and ordering types
//! - [`ChatMessage`] - Message record in its v1 (MAC) and v2 (envelope) forms
//! - [`PeerRecord`], [`AnchorRecord`], [`Endpoint`] - Gossiped peer data
//! - [`ControlEvent`] - Structural events on the `__control` channel
//! - [`Frame`] - Transport frames
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod control;
mod error;
mod frames;
mod ids;
mod message;
mod peer;

pub use control::{
    AnchorAnnounce, CallEvent, ChannelAction, ChannelEvent, CircleNameEvent, ControlEvent,
    MAX_NAME_CHARS,
};
pub use error::WireError;
pub use frames::{
    chunk_frames, Frame, MAX_FRAME_SIZE, MAX_PLAIN_FRAME, PROTOCOL_VERSION, SEAL_OVERHEAD,
};
pub use ids::{
    now_ms, ChannelId, CircleHint, CircleId, Cursor, MsgId, NodeId, CONTROL_CHANNEL,
    DEFAULT_CHANNEL,
};
pub use message::{
    ChatMessage, MessageBody, SealedBody, MAX_DISPLAY_NAME_CHARS, MAX_RECORD_BYTES, MAX_TEXT_BYTES,
    SCHEMA_V1, SCHEMA_V2,
};
pub use peer::{
    AddrFamily, AnchorRecord, Capabilities, Endpoint, NatClass, NodeIdentity, PeerRecord,
    TransportKind, MAX_ENDPOINTS, MAX_HOST_LEN,
};
