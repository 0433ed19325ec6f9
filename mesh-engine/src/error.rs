//! Engine-wide error type.
//!
//! Every layer has its own `thiserror` enum; [`MeshError`] aggregates them
//! and classifies each into an [`ErrorKind`]. Only configuration errors are
//! fatal. Everything else aborts one session or one tier and the node keeps
//! its last known state.

use mesh_core::{FailReason, SnapshotError};
use mesh_types::{CircleId, WireError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::discovery::DiscoveryError;
use crate::envelope::VerifyError;
use crate::relay::RelayError;
use crate::routing::TierFailure;
use crate::transport::TransportError;

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Peer does not hold the circle secret, or data failed verification.
    AuthFailure,
    /// Malformed, oversized or out-of-order frame.
    ProtocolViolation,
    /// A deadline expired.
    Timeout,
    /// I/O, relay or discovery unavailability.
    Transient,
    /// Unusable configuration.
    Config,
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame or record encoding error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Message failed verification.
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// Hosted relay error.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Discovery source error.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot error.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Reading or writing persisted state failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake ended in a failed state.
    #[error("handshake failed: {0:?}")]
    Handshake(FailReason),

    /// Peer broke the round protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A deadline expired.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// This node is not a member of the circle.
    #[error("unknown circle {0}")]
    UnknownCircle(CircleId),

    /// Every routing tier failed.
    #[error("all routing tiers failed ({} attempted)", .0.len())]
    AllTiersFailed(Vec<TierFailure>),
}

impl MeshError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::Crypto(CryptoError::DecryptionFailed) => ErrorKind::AuthFailure,
            MeshError::Crypto(CryptoError::Rng(_)) => ErrorKind::Transient,
            MeshError::Crypto(_) => ErrorKind::AuthFailure,
            MeshError::Transport(TransportError::Timeout) => ErrorKind::Timeout,
            MeshError::Transport(TransportError::FrameTooLarge { .. }) => {
                ErrorKind::ProtocolViolation
            }
            MeshError::Transport(_) => ErrorKind::Transient,
            MeshError::Wire(_) => ErrorKind::ProtocolViolation,
            MeshError::Verify(_) => ErrorKind::AuthFailure,
            MeshError::Relay(RelayError::Timeout) => ErrorKind::Timeout,
            MeshError::Relay(_) => ErrorKind::Transient,
            MeshError::Discovery(DiscoveryError::Replay(_)) => ErrorKind::AuthFailure,
            MeshError::Discovery(_) => ErrorKind::Transient,
            MeshError::Config(_) => ErrorKind::Config,
            MeshError::Snapshot(_) | MeshError::Io(_) => ErrorKind::Transient,
            MeshError::Handshake(reason) => match reason {
                FailReason::UnknownCircle
                | FailReason::AuthFailed
                | FailReason::EncryptionRefused => ErrorKind::AuthFailure,
                FailReason::ProtocolViolation => ErrorKind::ProtocolViolation,
                FailReason::Timeout => ErrorKind::Timeout,
            },
            MeshError::Protocol(_) => ErrorKind::ProtocolViolation,
            MeshError::Timeout(_) => ErrorKind::Timeout,
            MeshError::UnknownCircle(_) => ErrorKind::AuthFailure,
            MeshError::AllTiersFailed(_) => ErrorKind::Transient,
        }
    }

    /// Only configuration errors stop the node.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_is_fatal() {
        let config = MeshError::from(ConfigError::MissingSecret { index: 0 });
        assert_eq!(config.kind(), ErrorKind::Config);
        assert!(config.is_fatal());

        let others = [
            MeshError::Timeout("phase"),
            MeshError::Handshake(FailReason::AuthFailed),
            MeshError::Transport(TransportError::ConnectionClosed),
            MeshError::Protocol("bad".into()),
            MeshError::AllTiersFailed(Vec::new()),
        ];
        assert!(others.iter().all(|e| !e.is_fatal()));
    }

    #[test]
    fn handshake_reasons_classify() {
        assert_eq!(
            MeshError::Handshake(FailReason::AuthFailed).kind(),
            ErrorKind::AuthFailure
        );
        assert_eq!(
            MeshError::Handshake(FailReason::Timeout).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            MeshError::Handshake(FailReason::ProtocolViolation).kind(),
            ErrorKind::ProtocolViolation
        );
    }

    #[test]
    fn transport_classification() {
        assert_eq!(
            MeshError::from(TransportError::Timeout).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            MeshError::from(TransportError::FrameTooLarge { size: 2, max: 1 }).kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(
            MeshError::from(TransportError::ConnectionClosed).kind(),
            ErrorKind::Transient
        );
    }
}
