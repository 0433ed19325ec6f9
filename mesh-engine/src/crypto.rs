//! Cryptographic primitives for the circle mesh.
//!
//! This module provides:
//! - [`CircleSecret`]: the 32-byte shared circle key (hex or Argon2id passphrase)
//! - HKDF-SHA256 derivation of per-session and circle-wide envelope keys
//! - AES-256-GCM sealing of message envelopes and session frames
//! - HMAC-SHA256 handshake tokens and legacy message MACs
//!
//! # Security Notes
//!
//! - AES-GCM nonces are 96-bit and drawn fresh from the OS RNG on every call
//! - Frame AAD includes the direction so a sealed frame cannot be reflected
//! - Token and MAC comparisons are constant time
//! - Key material is zeroized on drop and redacted in `Debug`

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use mesh_types::{CircleId, NodeId};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key size (32 bytes).
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Handshake nonce size (16 bytes).
pub const HANDSHAKE_NONCE_SIZE: usize = 16;

const SESSION_INFO: &[u8] = b"circle-mesh-session-v1";
const ENVELOPE_SALT: &[u8] = b"circle-mesh-envelope-v1";
const FRAME_AAD_PREFIX: &[u8] = b"circle-mesh-frame-v1";
const PASSPHRASE_SALT: &[u8] = b"circle-mesh-passphrase-v1";

type HmacSha256 = Hmac<Sha256>;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Hex or base64 input did not decode.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// OS random number generator unavailable.
    #[error("random number generator failed: {0}")]
    Rng(String),
}

/// Fill a fixed-size array from the OS RNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Rng(e.to_string()))?;
    Ok(bytes)
}

/// Argon2id parameters for passphrase derivation.
///
/// Every member must use the same parameters to derive the same secret, so
/// the standard set is fixed rather than scaled to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    memory_mib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Argon2Params {
    /// The parameters used for configured passphrases: 19 MiB, 2 iterations.
    pub const STANDARD: Self = Self {
        memory_mib: 19,
        iterations: 2,
        parallelism: 1,
    };

    /// Custom parameters (tests use cheap ones).
    pub fn new(memory_mib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_mib,
            iterations,
            parallelism,
        }
    }

    /// Get memory in MiB.
    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    /// Get iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn to_argon2_params(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_mib * 1024, // Convert MiB to KiB
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// The shared secret of a circle. Never transmitted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircleSecret([u8; KEY_SIZE]);

impl CircleSecret {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters.
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let mut decoded =
            hex::decode(hex_str.trim()).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        if decoded.len() != KEY_SIZE {
            let actual = decoded.len();
            decoded.zeroize();
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual,
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    /// Derive from a passphrase with the standard Argon2id parameters.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        Self::from_passphrase_with_params(passphrase, Argon2Params::STANDARD)
    }

    /// Derive from a passphrase with explicit Argon2id parameters.
    pub fn from_passphrase_with_params(
        passphrase: &str,
        params: Argon2Params,
    ) -> Result<Self, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2_params()?);
        let mut output = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase.as_bytes(), PASSPHRASE_SALT, &mut output)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self(output))
    }

    /// Create a random secret.
    pub fn random() -> Result<Self, CryptoError> {
        Ok(Self(random_bytes()?))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// The circle id derived from this secret.
    pub fn circle_id(&self) -> CircleId {
        CircleId::from_secret(&self.0)
    }
}

// Don't leak secret in debug output
impl std::fmt::Debug for CircleSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CircleSecret([REDACTED])")
    }
}

/// Symmetric key for one session's frames.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Circle-wide key sealing message bodies.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey([u8; KEY_SIZE]);

impl EnvelopeKey {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeKey([REDACTED])")
    }
}

/// Derive the session key: HKDF-SHA256(secret, salt = client‖server nonce).
pub fn derive_session_key(
    secret: &CircleSecret,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<SessionKey, CryptoError> {
    let mut salt = Vec::with_capacity(client_nonce.len() + server_nonce.len());
    salt.extend_from_slice(client_nonce);
    salt.extend_from_slice(server_nonce);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), secret.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(SESSION_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(SessionKey(key))
}

/// Derive the circle-wide envelope key.
pub fn derive_envelope_key(
    secret: &CircleSecret,
    circle_id: &CircleId,
) -> Result<EnvelopeKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(ENVELOPE_SALT), secret.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(circle_id.as_str().as_bytes(), &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(EnvelopeKey(key))
}

/// AES-256-GCM encrypt with a fresh random nonce.
///
/// Returns `(nonce, ciphertext)`; the ciphertext includes the tag.
pub fn encrypt_envelope(
    key: &[u8; KEY_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes()?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

    Ok((nonce_bytes, ciphertext))
}

/// AES-256-GCM decrypt. Fails on any tag or AAD mismatch.
pub fn decrypt_envelope(
    key: &[u8; KEY_SIZE],
    aad: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn keyed_mac(secret: &CircleSecret) -> Result<HmacSha256, CryptoError> {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: secret.as_bytes().len(),
        }
    })
}

/// Legacy v1 message MAC: hex HMAC-SHA256 over the canonical fields.
pub fn compute_mac(secret: &CircleSecret, canonical: &[u8]) -> Result<String, CryptoError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(canonical);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a legacy MAC. Any mismatch or malformed input is `false`.
pub fn verify_mac(secret: &CircleSecret, canonical: &[u8], mac_hex: &str) -> bool {
    let Ok(expected) = hex::decode(mac_hex) else {
        return false;
    };
    let Ok(mut mac) = keyed_mac(secret) else {
        return false;
    };
    mac.update(canonical);
    mac.verify_slice(&expected).is_ok()
}

fn token_input(node_id: &NodeId, circle_id: &CircleId, server_nonce: &[u8]) -> Vec<u8> {
    let mut input = Vec::new();
    input.extend_from_slice(node_id.as_str().as_bytes());
    input.push(b'|');
    input.extend_from_slice(circle_id.as_str().as_bytes());
    input.push(b'|');
    input.extend_from_slice(server_nonce);
    input
}

/// Handshake token: hex HMAC-SHA256(secret, node_id|circle_id|server_nonce).
pub fn handshake_token(
    secret: &CircleSecret,
    node_id: &NodeId,
    circle_id: &CircleId,
    server_nonce: &[u8],
) -> Result<String, CryptoError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(&token_input(node_id, circle_id, server_nonce));
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a handshake token in constant time.
pub fn verify_handshake_token(
    secret: &CircleSecret,
    node_id: &NodeId,
    circle_id: &CircleId,
    server_nonce: &[u8],
    token_hex: &str,
) -> bool {
    let Ok(presented) = hex::decode(token_hex) else {
        return false;
    };
    let Ok(mut mac) = keyed_mac(secret) else {
        return false;
    };
    mac.update(&token_input(node_id, circle_id, server_nonce));
    mac.verify_slice(&presented).is_ok()
}

/// Direction of a sealed frame, bound into its AAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Initiator to responder.
    InitiatorToResponder,
    /// Responder to initiator.
    ResponderToInitiator,
}

impl Direction {
    fn byte(self) -> u8 {
        match self {
            Direction::InitiatorToResponder => 0x01,
            Direction::ResponderToInitiator => 0x02,
        }
    }
}

fn frame_aad(circle_id: &CircleId, direction: Direction) -> Vec<u8> {
    let mut aad = Vec::with_capacity(FRAME_AAD_PREFIX.len() + circle_id.as_str().len() + 3);
    aad.extend_from_slice(FRAME_AAD_PREFIX);
    aad.push(b'|');
    aad.extend_from_slice(circle_id.as_str().as_bytes());
    aad.push(b'|');
    aad.push(direction.byte());
    aad
}

/// Seal frame bytes: `nonce ‖ AES-GCM(frame)`.
pub fn seal_frame(
    key: &SessionKey,
    circle_id: &CircleId,
    direction: Direction,
    frame: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let (nonce, ciphertext) = encrypt_envelope(key.as_bytes(), &frame_aad(circle_id, direction), frame)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed frame produced by [`seal_frame`] for the same direction.
pub fn open_frame(
    key: &SessionKey,
    circle_id: &CircleId,
    direction: Direction,
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    decrypt_envelope(
        key.as_bytes(),
        &frame_aad(circle_id, direction),
        nonce,
        ciphertext,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> CircleSecret {
        CircleSecret::from_bytes([7u8; KEY_SIZE])
    }

    fn cheap() -> Argon2Params {
        Argon2Params::new(1, 1, 1)
    }

    // ===========================================
    // Secrets
    // ===========================================

    #[test]
    fn secret_from_hex() {
        let s = CircleSecret::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(s.as_bytes(), &[0xab; 32]);
    }

    #[test]
    fn secret_from_hex_rejects_wrong_length() {
        assert!(matches!(
            CircleSecret::from_hex("abcd"),
            Err(CryptoError::InvalidKeyLength { actual: 2, .. })
        ));
        assert!(matches!(
            CircleSecret::from_hex("zz"),
            Err(CryptoError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let a = CircleSecret::from_passphrase_with_params("river stone", cheap()).unwrap();
        let b = CircleSecret::from_passphrase_with_params("river stone", cheap()).unwrap();
        let c = CircleSecret::from_passphrase_with_params("river stones", cheap()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn debug_output_redacted() {
        let debug = format!("{:?}", secret());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains('7'));

        let key = derive_session_key(&secret(), &[1; 16], &[2; 16]).unwrap();
        assert_eq!(format!("{:?}", key), "SessionKey([REDACTED])");
    }

    // ===========================================
    // Key derivation
    // ===========================================

    #[test]
    fn session_key_depends_on_both_nonces() {
        let k1 = derive_session_key(&secret(), &[1; 16], &[2; 16]).unwrap();
        let k2 = derive_session_key(&secret(), &[1; 16], &[3; 16]).unwrap();
        let k3 = derive_session_key(&secret(), &[1; 16], &[2; 16]).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn envelope_key_is_per_circle() {
        let a = derive_envelope_key(&secret(), &CircleId::new("a")).unwrap();
        let b = derive_envelope_key(&secret(), &CircleId::new("b")).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    // ===========================================
    // AES-GCM envelopes
    // ===========================================

    #[test]
    fn envelope_roundtrip() {
        let key = [9u8; KEY_SIZE];
        let (nonce, ct) = encrypt_envelope(&key, b"header", b"hello").unwrap();
        assert_eq!(nonce.len(), 12);
        assert_eq!(decrypt_envelope(&key, b"header", &nonce, &ct).unwrap(), b"hello");
    }

    #[test]
    fn single_bit_flip_fails() {
        let key = [9u8; KEY_SIZE];
        let (nonce, ct) = encrypt_envelope(&key, b"header", b"hello").unwrap();
        for i in 0..ct.len() {
            let mut tampered = ct.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(
                decrypt_envelope(&key, b"header", &nonce, &tampered),
                Err(CryptoError::DecryptionFailed)
            ));
        }
    }

    #[test]
    fn aad_mismatch_fails() {
        let key = [9u8; KEY_SIZE];
        let (nonce, ct) = encrypt_envelope(&key, b"header", b"hello").unwrap();
        assert!(decrypt_envelope(&key, b"other", &nonce, &ct).is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        let key = [9u8; KEY_SIZE];
        let (n1, c1) = encrypt_envelope(&key, b"", b"same").unwrap();
        let (n2, c2) = encrypt_envelope(&key, b"", b"same").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    // ===========================================
    // MACs and tokens
    // ===========================================

    #[test]
    fn mac_verifies_and_detects_tamper() {
        let mac = compute_mac(&secret(), b"a|b|c").unwrap();
        assert!(verify_mac(&secret(), b"a|b|c", &mac));
        assert!(!verify_mac(&secret(), b"a|b|d", &mac));
        assert!(!verify_mac(&secret(), b"a|b|c", "not hex"));
        let other = CircleSecret::from_bytes([8u8; KEY_SIZE]);
        assert!(!verify_mac(&other, b"a|b|c", &mac));
    }

    #[test]
    fn handshake_token_binds_all_inputs() {
        let node = NodeId::new("n");
        let circle = CircleId::new("c");
        let token = handshake_token(&secret(), &node, &circle, &[5; 16]).unwrap();
        assert!(verify_handshake_token(&secret(), &node, &circle, &[5; 16], &token));
        assert!(!verify_handshake_token(&secret(), &NodeId::new("m"), &circle, &[5; 16], &token));
        assert!(!verify_handshake_token(&secret(), &node, &circle, &[6; 16], &token));
        let wrong = CircleSecret::from_bytes([1u8; KEY_SIZE]);
        assert!(!verify_handshake_token(&wrong, &node, &circle, &[5; 16], &token));
    }

    // ===========================================
    // Frame sealing
    // ===========================================

    #[test]
    fn frame_roundtrip_and_no_reflection() {
        let key = derive_session_key(&secret(), &[1; 16], &[2; 16]).unwrap();
        let circle = CircleId::new("c");
        let sealed = seal_frame(&key, &circle, Direction::InitiatorToResponder, b"frame").unwrap();
        assert_eq!(
            open_frame(&key, &circle, Direction::InitiatorToResponder, &sealed).unwrap(),
            b"frame"
        );
        assert!(open_frame(&key, &circle, Direction::ResponderToInitiator, &sealed).is_err());
        assert!(open_frame(&key, &CircleId::new("d"), Direction::InitiatorToResponder, &sealed).is_err());
    }

    #[test]
    fn short_frame_rejected() {
        let key = derive_session_key(&secret(), &[1; 16], &[2; 16]).unwrap();
        assert!(open_frame(&key, &CircleId::new("c"), Direction::InitiatorToResponder, &[0; 4]).is_err());
    }
}
