//! Wire-level error types.

use thiserror::Error;

/// Errors raised while encoding, decoding or validating wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON body could not be encoded or decoded
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoded frame exceeds the frame budget
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Outbound record exceeds the per-record cap
    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge {
        /// Encoded size in bytes
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Message text exceeds the per-message cap
    #[error("message text too long: {0} bytes")]
    TextTooLong(usize),

    /// Unsupported protocol or schema version
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Structurally invalid data
    #[error("invalid data: {0}")]
    InvalidData(String),
}
