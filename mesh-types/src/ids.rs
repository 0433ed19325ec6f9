//! Identity and ordering types for the circle mesh.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Reserved channel carrying structural events (channels, names, anchors, calls).
pub const CONTROL_CHANNEL: &str = "__control";

/// Channel every circle starts with.
pub const DEFAULT_CHANNEL: &str = "general";

/// Opaque identifier of a node in the mesh.
///
/// Generated locally (UUIDv4, simple form) unless pinned by configuration.
/// Immutable for the lifetime of the process.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new random NodeId.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "NodeId({})", short)
    }
}

/// Identifier of a circle, derived from the shared secret.
///
/// Hex of the first 16 bytes of `SHA-256(domain ‖ secret)`. Only ever sent
/// inside authenticated sessions; relays see the [`CircleHint`] instead.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircleId(String);

impl CircleId {
    /// Derive the CircleId from the circle secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"circle-mesh-circle-id-v1");
        hasher.update(secret);
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Wrap an existing identifier (e.g. read back from a frame).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The truncated digest exposed to discovery and hosted relays.
    pub fn hint(&self) -> CircleHint {
        CircleHint::of(self)
    }
}

impl fmt::Display for CircleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CircleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "CircleId({})", short)
    }
}

/// The only circle identifier given to untrusted services.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircleHint(String);

impl CircleHint {
    /// Hex of the first 8 bytes of `SHA-256(domain ‖ circle_id)`.
    pub fn of(circle_id: &CircleId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"circle-mesh-hint-v1");
        hasher.update(circle_id.as_str().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    /// Get the hint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircleHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CircleHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CircleHint({})", self.0)
    }
}

/// Unique, author-chosen identifier of a chat message.
///
/// UUID v4 in simple (32 hex chars) form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    /// Create a new random MsgId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing identifier.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MsgId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({})", self.0)
    }
}

/// Channel within a circle.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap a channel name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved control channel.
    pub fn control() -> Self {
        Self(CONTROL_CHANNEL.to_string())
    }

    /// The default chat channel.
    pub fn general() -> Self {
        Self(DEFAULT_CHANNEL.to_string())
    }

    /// Whether this is the reserved control channel.
    pub fn is_control(&self) -> bool {
        self.0 == CONTROL_CHANNEL
    }

    /// Get the channel id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// A monotonically increasing cursor for resuming pulls.
///
/// Assigned by an anchor store or hosted relay, not by authors. Cursors are
/// more reliable than timestamps because device clocks can drift.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Cursor(u64);

impl Cursor {
    /// Create a new Cursor with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Cursor.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Create a Cursor representing "no data yet".
    pub fn zero() -> Self {
        Self(0)
    }

    /// Increment the cursor by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({})", self.0)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
