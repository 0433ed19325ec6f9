//! Composing and verifying chat message records.
//!
//! v2 records seal `{display_name, text}` under the circle envelope key with
//! the record header as AAD. v1 records carry clear fields and an HMAC. On
//! receipt the ciphertext is authoritative: any plaintext cache that arrived
//! with a v2 record is discarded and re-derived from the envelope.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use mesh_types::{
    ChannelId, ChatMessage, CircleId, MessageBody, MsgId, NodeId, SealedBody, WireError,
    MAX_DISPLAY_NAME_CHARS, MAX_TEXT_BYTES, SCHEMA_V1, SCHEMA_V2,
};
use thiserror::Error;

use crate::crypto::{
    compute_mac, decrypt_envelope, encrypt_envelope, verify_mac, CircleSecret, EnvelopeKey,
};

/// Why a received record was discarded.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Structurally invalid for its schema.
    #[error("malformed record: {0}")]
    Malformed(#[from] WireError),

    /// Belongs to another circle.
    #[error("record belongs to another circle")]
    WrongCircle,

    /// Nonce or ciphertext is not valid base64.
    #[error("envelope encoding invalid")]
    Encoding,

    /// AES-GCM authentication failed.
    #[error("envelope authentication failed")]
    Decrypt,

    /// Legacy MAC did not match.
    #[error("legacy mac mismatch")]
    MacMismatch,
}

/// Header fields of a message being authored.
#[derive(Debug, Clone)]
pub struct Draft<'a> {
    /// Id to use instead of a fresh random one
    pub msg_id: Option<&'a MsgId>,
    /// Target circle
    pub circle_id: &'a CircleId,
    /// Target channel
    pub channel_id: &'a ChannelId,
    /// Local node
    pub author: &'a NodeId,
    /// Author display name
    pub display_name: &'a str,
    /// Message text
    pub text: &'a str,
    /// Creation time (ms)
    pub created_ts: u64,
}

impl Draft<'_> {
    fn check(&self) -> Result<(), WireError> {
        if self.text.len() > MAX_TEXT_BYTES {
            return Err(WireError::TextTooLong(self.text.len()));
        }
        Ok(())
    }

    fn display_name(&self) -> String {
        self.display_name.chars().take(MAX_DISPLAY_NAME_CHARS).collect()
    }

    fn header(&self, schema_version: u8) -> ChatMessage {
        ChatMessage {
            msg_id: self.msg_id.cloned().unwrap_or_default(),
            circle_id: self.circle_id.clone(),
            channel_id: self.channel_id.clone(),
            author_node_id: self.author.clone(),
            created_ts: self.created_ts,
            schema_version,
            display_name: None,
            text: None,
            mac: None,
            enc: None,
        }
    }
}

/// Author a v2 envelope. The returned record keeps its plaintext cache.
pub fn compose_v2(key: &EnvelopeKey, draft: &Draft<'_>) -> Result<ChatMessage, crate::MeshError> {
    draft.check()?;
    let mut message = draft.header(SCHEMA_V2);
    let body = MessageBody {
        display_name: draft.display_name(),
        text: draft.text.to_string(),
    };
    let (nonce, ciphertext) = encrypt_envelope(key.as_bytes(), &message.aad(), &body.to_json()?)?;
    message.enc = Some(SealedBody {
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    });
    message.display_name = Some(body.display_name);
    message.text = Some(body.text);
    message.check_record_size()?;
    Ok(message)
}

/// Author a legacy v1 record.
pub fn compose_v1(secret: &CircleSecret, draft: &Draft<'_>) -> Result<ChatMessage, crate::MeshError> {
    draft.check()?;
    let mut message = draft.header(SCHEMA_V1);
    message.display_name = Some(draft.display_name());
    message.text = Some(draft.text.to_string());
    message.mac = Some(compute_mac(secret, &message.canonical_fields())?);
    message.check_record_size()?;
    Ok(message)
}

/// Verify a received record for `circle_id`.
///
/// The circle check runs before any cryptographic result is looked at.
/// Returns the record with a freshly derived plaintext cache.
pub fn open(
    message: ChatMessage,
    circle_id: &CircleId,
    secret: &CircleSecret,
    key: &EnvelopeKey,
) -> Result<ChatMessage, VerifyError> {
    if &message.circle_id != circle_id {
        return Err(VerifyError::WrongCircle);
    }
    message.validate_shape()?;

    match message.schema_version {
        SCHEMA_V2 => open_v2(message, key),
        _ => {
            let mac = message.mac.as_deref().unwrap_or_default();
            if verify_mac(secret, &message.canonical_fields(), mac) {
                Ok(message)
            } else {
                Err(VerifyError::MacMismatch)
            }
        }
    }
}

fn open_v2(message: ChatMessage, key: &EnvelopeKey) -> Result<ChatMessage, VerifyError> {
    let mut message = message.sealed();
    let sealed = message.enc.as_ref().ok_or(VerifyError::Encoding)?;
    let nonce = STANDARD.decode(&sealed.nonce).map_err(|_| VerifyError::Encoding)?;
    let ciphertext = STANDARD
        .decode(&sealed.ciphertext)
        .map_err(|_| VerifyError::Encoding)?;

    let plaintext = decrypt_envelope(key.as_bytes(), &message.aad(), &nonce, &ciphertext)
        .map_err(|_| VerifyError::Decrypt)?;
    let body = MessageBody::from_json(&plaintext)?;
    if body.text.len() > MAX_TEXT_BYTES {
        return Err(VerifyError::Malformed(WireError::TextTooLong(body.text.len())));
    }

    message.display_name = Some(body.display_name);
    message.text = Some(body.text);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_envelope_key;
    use mesh_types::{Frame, MAX_PLAIN_FRAME, MAX_RECORD_BYTES};

    struct Fixture {
        secret: CircleSecret,
        key: EnvelopeKey,
        circle: CircleId,
        channel: ChannelId,
        author: NodeId,
    }

    fn fixture() -> Fixture {
        let secret = CircleSecret::from_bytes([3u8; 32]);
        let circle = secret.circle_id();
        let key = derive_envelope_key(&secret, &circle).unwrap();
        Fixture {
            secret,
            key,
            circle,
            channel: ChannelId::general(),
            author: NodeId::new("alice-node"),
        }
    }

    fn draft<'a>(f: &'a Fixture, text: &'a str) -> Draft<'a> {
        Draft {
            msg_id: None,
            circle_id: &f.circle,
            channel_id: &f.channel,
            author: &f.author,
            display_name: "alice",
            text,
            created_ts: 1_700_000_000_000,
        }
    }

    // ===========================================
    // v2 envelopes
    // ===========================================

    #[test]
    fn v2_roundtrip_rederives_plaintext() {
        let f = fixture();
        let message = compose_v2(&f.key, &draft(&f, "hi")).unwrap();
        assert_eq!(message.text.as_deref(), Some("hi"));

        let sealed = message.sealed();
        assert!(!sealed.has_plaintext());

        let opened = open(sealed, &f.circle, &f.secret, &f.key).unwrap();
        assert_eq!(opened.text.as_deref(), Some("hi"));
        assert_eq!(opened.display_name.as_deref(), Some("alice"));
    }

    #[test]
    fn forged_plaintext_cache_is_replaced() {
        let f = fixture();
        let mut message = compose_v2(&f.key, &draft(&f, "real")).unwrap();
        message.text = Some("forged".into());
        let opened = open(message, &f.circle, &f.secret, &f.key).unwrap();
        assert_eq!(opened.text.as_deref(), Some("real"));
    }

    #[test]
    fn tampered_header_fails() {
        let f = fixture();
        let mut message = compose_v2(&f.key, &draft(&f, "hi")).unwrap().sealed();
        message.created_ts += 1;
        assert!(matches!(
            open(message, &f.circle, &f.secret, &f.key),
            Err(VerifyError::Decrypt)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let f = fixture();
        let message = compose_v2(&f.key, &draft(&f, "hi")).unwrap().sealed();
        let other = derive_envelope_key(&CircleSecret::from_bytes([4u8; 32]), &f.circle).unwrap();
        assert!(open(message, &f.circle, &f.secret, &other).is_err());
    }

    #[test]
    fn cross_circle_rejected_before_crypto() {
        let f = fixture();
        let message = compose_v2(&f.key, &draft(&f, "hi")).unwrap();
        let elsewhere = CircleId::new("another-circle");
        assert!(matches!(
            open(message, &elsewhere, &f.secret, &f.key),
            Err(VerifyError::WrongCircle)
        ));
    }

    #[test]
    fn oversized_text_refused_at_compose() {
        let f = fixture();
        let text = "x".repeat(MAX_TEXT_BYTES + 1);
        assert!(compose_v2(&f.key, &draft(&f, &text)).is_err());
    }

    #[test]
    fn largest_plain_text_fits_one_frame() {
        let f = fixture();
        let name = "n".repeat(MAX_DISPLAY_NAME_CHARS);
        let text = "x".repeat(MAX_TEXT_BYTES);
        let mut d = draft(&f, &text);
        d.display_name = &name;
        let sealed = compose_v2(&f.key, &d).unwrap().sealed();
        assert!(sealed.encoded_len() <= MAX_RECORD_BYTES);

        let frame = Frame::MsgsSend {
            messages: vec![sealed],
            more: false,
        };
        assert!(frame.to_bytes().unwrap().len() <= MAX_PLAIN_FRAME);
    }

    #[test]
    fn escape_heavy_text_refused_at_compose() {
        let f = fixture();
        let text = "\u{1}".repeat(MAX_TEXT_BYTES);
        assert_eq!(text.len(), MAX_TEXT_BYTES);
        assert!(matches!(
            compose_v2(&f.key, &draft(&f, &text)),
            Err(crate::MeshError::Wire(WireError::RecordTooLarge { .. }))
        ));
        assert!(compose_v1(&f.secret, &draft(&f, &text)).is_err());
    }

    #[test]
    fn display_name_truncated() {
        let f = fixture();
        let long = "n".repeat(100);
        let mut d = draft(&f, "hi");
        d.display_name = &long;
        let message = compose_v2(&f.key, &d).unwrap();
        assert_eq!(message.display_name.unwrap().chars().count(), MAX_DISPLAY_NAME_CHARS);
    }

    // ===========================================
    // v1 legacy
    // ===========================================

    #[test]
    fn v1_verifies_and_detects_tamper() {
        let f = fixture();
        let message = compose_v1(&f.secret, &draft(&f, "legacy")).unwrap();
        assert!(open(message.clone(), &f.circle, &f.secret, &f.key).is_ok());

        let mut tampered = message;
        tampered.text = Some("changed".into());
        assert!(matches!(
            open(tampered, &f.circle, &f.secret, &f.key),
            Err(VerifyError::MacMismatch)
        ));
    }

    #[test]
    fn v1_without_mac_is_malformed() {
        let f = fixture();
        let mut message = compose_v1(&f.secret, &draft(&f, "legacy")).unwrap();
        message.mac = None;
        assert!(matches!(
            open(message, &f.circle, &f.secret, &f.key),
            Err(VerifyError::Malformed(_))
        ));
    }
}
