//! Chat messages and their sealed envelope form.
//!
//! A [`ChatMessage`] is immutable once authored and identified by its
//! [`MsgId`]. Two schema versions exist on the wire:
//!
//! - v1 (legacy): clear `display_name`/`text` authenticated by an HMAC `mac`.
//! - v2 (envelope): `enc` seals the JSON [`MessageBody`]; any clear
//!   `display_name`/`text` on a v2 record is a local decrypt-time cache and
//!   is stripped by [`ChatMessage::sealed`] before the record leaves the node.

use serde::{Deserialize, Serialize};

use crate::{ChannelId, CircleId, MsgId, NodeId, WireError};

/// Legacy schema: plaintext plus MAC.
pub const SCHEMA_V1: u8 = 1;

/// Envelope schema: AES-GCM sealed body.
pub const SCHEMA_V2: u8 = 2;

/// Maximum UTF-8 length of a message text.
pub const MAX_TEXT_BYTES: usize = 4096;

/// Maximum display name length in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Maximum encoded size of a record as it leaves the node (8 KiB).
///
/// Well under [`crate::MAX_PLAIN_FRAME`], so any record within it travels
/// alone in every list frame and is accepted by hosted relays.
pub const MAX_RECORD_BYTES: usize = 8 * 1024;

/// Sealed message body (base64 nonce and ciphertext).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBody {
    /// Base64 of the 96-bit AES-GCM nonce
    pub nonce: String,
    /// Base64 of ciphertext plus tag
    pub ciphertext: String,
}

impl std::fmt::Debug for SealedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBody")
            .field("nonce", &self.nonce)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// The plaintext sealed inside a v2 envelope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Author's display name at posting time
    pub display_name: String,
    /// Message text
    pub text: String,
}

impl MessageBody {
    /// Encode as the JSON bytes that get sealed.
    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from opened envelope bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl std::fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBody")
            .field("display_name", &self.display_name)
            .field("text", &"[REDACTED]")
            .finish()
    }
}

/// A chat message record as stored, gossiped and relayed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier chosen by the author
    pub msg_id: MsgId,
    /// Circle this message belongs to
    pub circle_id: CircleId,
    /// Channel within the circle
    pub channel_id: ChannelId,
    /// Authoring node
    pub author_node_id: NodeId,
    /// Author-supplied creation time (ms since epoch)
    pub created_ts: u64,
    /// [`SCHEMA_V1`] or [`SCHEMA_V2`]
    pub schema_version: u8,
    /// Clear display name (v1 wire field, v2 local cache)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Clear text (v1 wire field, v2 local cache)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Hex HMAC over the canonical fields (v1 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sealed body (v2 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc: Option<SealedBody>,
}

impl ChatMessage {
    /// Additional authenticated data binding an envelope to its header.
    ///
    /// `msg_id|circle_id|channel_id|author_node_id|created_ts`
    pub fn aad(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}",
            self.msg_id, self.circle_id, self.channel_id, self.author_node_id, self.created_ts
        )
        .into_bytes()
    }

    /// Canonical byte string covered by the legacy MAC.
    ///
    /// `msg_id|circle_id|channel_id|author_node_id|created_ts|display_name|text`
    pub fn canonical_fields(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.msg_id,
            self.circle_id,
            self.channel_id,
            self.author_node_id,
            self.created_ts,
            self.display_name.as_deref().unwrap_or_default(),
            self.text.as_deref().unwrap_or_default()
        )
        .into_bytes()
    }

    /// Whether this is a v2 envelope record.
    pub fn is_envelope(&self) -> bool {
        self.schema_version == SCHEMA_V2
    }

    /// Whether the record carries any cleartext body fields.
    pub fn has_plaintext(&self) -> bool {
        self.display_name.is_some() || self.text.is_some()
    }

    /// Copy suitable for leaving this node.
    ///
    /// v2 records lose their plaintext cache; v1 records are returned as-is
    /// because their clear fields are part of the authenticated wire form.
    pub fn sealed(&self) -> ChatMessage {
        let mut out = self.clone();
        if out.is_envelope() {
            out.display_name = None;
            out.text = None;
        }
        out
    }

    /// Check the structural shape for the declared schema version.
    ///
    /// Cryptographic verification happens elsewhere; this only rejects records
    /// that could never verify or would overflow a frame.
    pub fn validate_shape(&self) -> Result<(), WireError> {
        match self.schema_version {
            SCHEMA_V1 => {
                if self.mac.is_none() || self.text.is_none() || self.enc.is_some() {
                    return Err(WireError::InvalidData("malformed v1 message".into()));
                }
            }
            SCHEMA_V2 => {
                if self.enc.is_none() || self.mac.is_some() {
                    return Err(WireError::InvalidData("malformed v2 message".into()));
                }
            }
            other => return Err(WireError::UnsupportedVersion(other)),
        }
        if let Some(text) = &self.text {
            if text.len() > MAX_TEXT_BYTES {
                return Err(WireError::TextTooLong(text.len()));
            }
        }
        if self.msg_id.as_str().is_empty() || self.channel_id.as_str().is_empty() {
            return Err(WireError::InvalidData("empty identifier".into()));
        }
        Ok(())
    }

    /// Size of the JSON encoding of this record, used by size-bounded stores.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Refuse records whose outbound form exceeds [`MAX_RECORD_BYTES`].
    ///
    /// The text cap alone does not bound this: JSON escaping and base64 can
    /// grow a 4096-byte text several times over.
    pub fn check_record_size(&self) -> Result<(), WireError> {
        let size = self.sealed().encoded_len();
        if size > MAX_RECORD_BYTES {
            return Err(WireError::RecordTooLarge {
                size,
                max: MAX_RECORD_BYTES,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatMessage")
            .field("msg_id", &self.msg_id)
            .field("circle_id", &self.circle_id)
            .field("channel_id", &self.channel_id)
            .field("author_node_id", &self.author_node_id)
            .field("created_ts", &self.created_ts)
            .field("schema_version", &self.schema_version)
            .field("display_name", &self.display_name)
            .field("text", &self.text.as_ref().map(|_| "[REDACTED]"))
            .field("enc", &self.enc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_message() -> ChatMessage {
        ChatMessage {
            msg_id: MsgId::from_string("abc123"),
            circle_id: CircleId::new("c1"),
            channel_id: ChannelId::general(),
            author_node_id: NodeId::new("node-a"),
            created_ts: 1_700_000_000_000,
            schema_version: SCHEMA_V2,
            display_name: Some("alice".into()),
            text: Some("hi".into()),
            mac: None,
            enc: Some(SealedBody {
                nonce: "bm9uY2U=".into(),
                ciphertext: "Y2lwaGVy".into(),
            }),
        }
    }

    #[test]
    fn aad_has_header_fields_only() {
        let msg = v2_message();
        assert_eq!(msg.aad(), b"abc123|c1|general|node-a|1700000000000".to_vec());
    }

    #[test]
    fn canonical_fields_include_body() {
        let mut msg = v2_message();
        msg.schema_version = SCHEMA_V1;
        assert_eq!(
            msg.canonical_fields(),
            b"abc123|c1|general|node-a|1700000000000|alice|hi".to_vec()
        );
    }

    #[test]
    fn sealed_strips_plaintext_cache() {
        let sealed = v2_message().sealed();
        assert!(sealed.display_name.is_none());
        assert!(sealed.text.is_none());
        assert!(sealed.enc.is_some());
    }

    #[test]
    fn sealed_keeps_v1_fields() {
        let mut msg = v2_message();
        msg.schema_version = SCHEMA_V1;
        msg.enc = None;
        msg.mac = Some("00".into());
        let sealed = msg.sealed();
        assert_eq!(sealed.text.as_deref(), Some("hi"));
    }

    #[test]
    fn sealed_json_omits_absent_fields() {
        let json = serde_json::to_string(&v2_message().sealed()).unwrap();
        assert!(!json.contains("\"text\""));
        assert!(!json.contains("\"mac\""));
        assert!(json.contains("\"enc\""));
    }

    #[test]
    fn validate_shape_rejects_oversized_text() {
        let mut msg = v2_message();
        msg.text = Some("x".repeat(MAX_TEXT_BYTES + 1));
        assert!(matches!(msg.validate_shape(), Err(WireError::TextTooLong(_))));
    }

    #[test]
    fn record_size_counts_outbound_form_only() {
        let mut msg = v2_message();
        // The plaintext cache never leaves the node.
        msg.text = Some("x".repeat(MAX_RECORD_BYTES));
        assert!(msg.check_record_size().is_ok());

        msg.enc = Some(SealedBody {
            nonce: "bm9uY2U=".into(),
            ciphertext: "A".repeat(MAX_RECORD_BYTES),
        });
        assert!(matches!(
            msg.check_record_size(),
            Err(WireError::RecordTooLarge { max: MAX_RECORD_BYTES, .. })
        ));
    }

    #[test]
    fn validate_shape_rejects_v2_without_enc() {
        let mut msg = v2_message();
        msg.enc = None;
        assert!(msg.validate_shape().is_err());
    }

    #[test]
    fn validate_shape_rejects_unknown_schema() {
        let mut msg = v2_message();
        msg.schema_version = 9;
        assert!(matches!(
            msg.validate_shape(),
            Err(WireError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn debug_redacts_text() {
        let debug = format!("{:?}", v2_message());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("\"hi\""));
    }

    #[test]
    fn body_json_roundtrip() {
        let body = MessageBody {
            display_name: "alice".into(),
            text: "hello".into(),
        };
        let restored = MessageBody::from_json(&body.to_json().unwrap()).unwrap();
        assert_eq!(body, restored);
    }
}
