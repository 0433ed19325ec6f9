//! Structural events carried on the `__control` channel.
//!
//! Control events are the text of ordinary chat messages posted to the
//! reserved control channel, so they inherit the message's encryption,
//! authentication and gossip. The body is JSON tagged by `type`. Unknown
//! types and bodies that fail validation are ignored by receivers.

use serde::{Deserialize, Serialize};

use crate::{Capabilities, ChannelId, NodeId, WireError};

/// Maximum length (in characters) of a channel or circle name.
pub const MAX_NAME_CHARS: usize = 64;

/// Channel lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAction {
    /// Create a channel
    Create,
    /// Rename an existing channel
    Rename,
    /// Archive a channel
    Archive,
}

/// Channel create/rename/archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Lifecycle action
    pub action: ChannelAction,
    /// Target channel
    pub channel_id: ChannelId,
    /// Display name (may be empty for archive)
    #[serde(default)]
    pub name: String,
}

/// Circle rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleNameEvent {
    /// New circle name
    pub name: String,
}

/// A node offering to act as anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorAnnounce {
    /// Announcing node (must equal the message author)
    pub node_id: NodeId,
    /// Capabilities at announce time
    pub capabilities: Capabilities,
    /// Announcement time (ms)
    pub announced_at: u64,
}

/// Opaque call-signalling payload forwarded to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Call identifier
    pub call_id: String,
    /// Signal kind (offer, answer, candidate, hangup...)
    pub kind: String,
    /// Signal body, untouched
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// All control-channel events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// Channel lifecycle
    #[serde(rename = "CHANNEL_EVT")]
    Channel(ChannelEvent),
    /// Circle rename
    #[serde(rename = "CIRCLE_NAME_EVT")]
    CircleName(CircleNameEvent),
    /// Anchor offer
    #[serde(rename = "ANCHOR_ANNOUNCE")]
    AnchorAnnounce(AnchorAnnounce),
    /// Call signalling
    #[serde(rename = "CALL_EVT")]
    Call(CallEvent),
}

impl ControlEvent {
    /// Encode as the JSON text posted to the control channel.
    pub fn to_text(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate control text authored by `author`.
    ///
    /// Returns `None` for unknown event types or invalid bodies.
    pub fn parse(text: &str, author: &NodeId) -> Option<ControlEvent> {
        let event: ControlEvent = serde_json::from_str(text).ok()?;
        event.validate(author).ok()?;
        Some(event)
    }

    /// Per-kind validation.
    pub fn validate(&self, author: &NodeId) -> Result<(), WireError> {
        match self {
            ControlEvent::Channel(evt) => {
                if evt.channel_id.as_str().is_empty() || evt.channel_id.is_control() {
                    return Err(WireError::InvalidData("bad channel id".into()));
                }
                if evt.action != ChannelAction::Archive && evt.name.trim().is_empty() {
                    return Err(WireError::InvalidData("empty channel name".into()));
                }
                check_name(&evt.name)
            }
            ControlEvent::CircleName(evt) => {
                if evt.name.trim().is_empty() {
                    return Err(WireError::InvalidData("empty circle name".into()));
                }
                check_name(&evt.name)
            }
            ControlEvent::AnchorAnnounce(evt) => {
                if &evt.node_id != author {
                    return Err(WireError::InvalidData("announce for another node".into()));
                }
                Ok(())
            }
            ControlEvent::Call(evt) => {
                if evt.call_id.is_empty() || evt.kind.is_empty() {
                    return Err(WireError::InvalidData("empty call id".into()));
                }
                Ok(())
            }
        }
    }
}

fn check_name(name: &str) -> Result<(), WireError> {
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(WireError::InvalidData("name too long".into()));
    }
    Ok(())
}
