//! Persisted circle state.
//!
//! A snapshot holds only what can be re-verified on restore: sealed messages,
//! peer records and anchor offers. Derived state (channels, names, plaintext
//! caches) is rebuilt from the messages when the snapshot is loaded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mesh_types::{AnchorRecord, ChatMessage, CircleId, PeerRecord};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors reading or writing snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// JSON encoding or decoding failed
    #[error("snapshot json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown format version
    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    /// Snapshot belongs to another circle
    #[error("snapshot is for circle {found}, expected {expected}")]
    CircleMismatch {
        /// Circle the caller restores into
        expected: CircleId,
        /// Circle named in the snapshot
        found: CircleId,
    },
}

/// Serializable state of one circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleSnapshot {
    /// Format version
    pub version: u32,
    /// Circle id
    pub circle_id: CircleId,
    /// Sealed messages
    pub messages: Vec<ChatMessage>,
    /// Known peers
    pub peers: Vec<PeerRecord>,
    /// Anchor offers
    pub anchors: Vec<AnchorRecord>,
}

impl CircleSnapshot {
    /// Build a snapshot, sealing every message on the way in.
    pub fn new(
        circle_id: CircleId,
        messages: impl IntoIterator<Item = ChatMessage>,
        peers: Vec<PeerRecord>,
        anchors: Vec<AnchorRecord>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            circle_id,
            messages: messages.into_iter().map(|m| m.sealed()).collect(),
            peers,
            anchors,
        }
    }

    /// Encode as pretty JSON.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode and check it belongs to `expected`.
    pub fn from_json(json: &str, expected: &CircleId) -> Result<Self, SnapshotError> {
        let snapshot: CircleSnapshot = serde_json::from_str(json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        if &snapshot.circle_id != expected {
            return Err(SnapshotError::CircleMismatch {
                expected: expected.clone(),
                found: snapshot.circle_id,
            });
        }
        Ok(snapshot)
    }
}
