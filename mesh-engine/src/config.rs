//! Configuration loading for a mesh node.
//!
//! Configuration is loaded from a TOML file (default: `mesh.toml`). Every
//! section and field has a default, so an empty file plus one `[[circles]]`
//! entry is a complete configuration.

use crate::crypto::{CircleSecret, CryptoError};
use mesh_core::{AnchorPolicy, AnchorStorePolicy, RetentionPolicy};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a mesh node.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and listener.
    pub node: NodeSection,
    /// Gossip round timing.
    pub sync: SyncSection,
    /// Per-tier routing timeouts and relay backoff.
    pub routing: RoutingSection,
    /// Anchor election and store limits.
    pub anchor: AnchorSection,
    /// Local message retention.
    pub store: StoreSection,
    /// Discovery refresh.
    pub discovery: DiscoverySection,
    /// Circles this node belongs to.
    pub circles: Vec<CircleConfig>,
}

/// Node identity and listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Pinned node id (random per process when absent).
    pub node_id: Option<String>,
    /// Name carried on authored messages (default: "anonymous").
    pub display_name: String,
    /// Bind address for inbound sessions (default: 0.0.0.0:7420).
    pub listen: String,
    /// Host advertised to peers instead of the bound address.
    pub advertise_host: Option<String>,
    /// Offer to act as anchor (default: false).
    pub can_anchor: bool,
    /// Running on a mobile device (default: false).
    pub is_mobile: bool,
    /// Raise the log level to debug (default: false).
    pub debug: bool,
    /// Directory for circle snapshots; persistence is off when absent.
    pub state_dir: Option<PathBuf>,
}

/// Gossip round timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Seconds between sync ticks (default: 15).
    pub interval_secs: u64,
    /// Per-frame read deadline during the handshake and rounds (default: 12).
    pub frame_timeout_secs: u64,
    /// Deadline for each sync phase (default: 30).
    pub phase_timeout_secs: u64,
}

/// Routing tier timeouts and relay backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// Direct tier timeout (default: 20).
    pub direct_timeout_secs: u64,
    /// Anchor tiers timeout (default: 20).
    pub anchor_timeout_secs: u64,
    /// Hosted realtime relay timeout (default: 10).
    pub realtime_timeout_secs: u64,
    /// Hosted store relay timeout (default: 30).
    pub store_timeout_secs: u64,
    /// First relay retry delay (default: 500).
    pub backoff_base_ms: u64,
    /// Relay retry ceiling (default: 30000).
    pub backoff_cap_ms: u64,
}

/// Anchor election and store limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnchorSection {
    /// Seconds between ANCHOR_ANNOUNCE posts (default: 60).
    pub announce_interval_secs: u64,
    /// Anchor unseen this long is replaced (default: 20).
    pub stale_after_secs: u64,
    /// Minimum gap between voluntary switches (default: 60).
    pub cooldown_secs: u64,
    /// Envelope age limit in the anchor store (default: 24).
    pub max_age_hours: u64,
    /// Envelopes per channel in the anchor store (default: 500).
    pub max_per_channel: usize,
    /// Anchor store size limit (default: 50).
    pub max_total_mib: usize,
}

/// Local message retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Drop messages older than this (default: 30; 0 disables).
    pub max_age_days: u64,
    /// Keep at most this many messages per channel (default: 5000; 0 disables).
    pub max_per_channel: usize,
    /// Seconds between pruning passes (default: 300).
    pub prune_interval_secs: u64,
}

/// Discovery refresh.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Use the configured discovery source (default: true).
    pub enabled: bool,
    /// Seconds between register/lookup passes (default: 60).
    pub refresh_interval_secs: u64,
    /// Registration TTL (default: 600).
    pub ttl_secs: u64,
    /// Peers requested per lookup (default: 32).
    pub lookup_limit: usize,
    /// Attempts per refresh before giving up until the next tick (default: 3).
    pub max_attempts: u32,
    /// Peer record TTL without a sighting (default: 600).
    pub peer_ttl_secs: u64,
}

/// One circle membership.
#[derive(Clone, Deserialize, Default)]
#[serde(default)]
pub struct CircleConfig {
    /// 64 hex characters.
    pub secret: Option<String>,
    /// Passphrase derived with Argon2id when no hex secret is given.
    pub passphrase: Option<String>,
    /// Local label for logs.
    pub label: Option<String>,
}

// Don't leak secrets in debug output
impl std::fmt::Debug for CircleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircleConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .field("label", &self.label)
            .finish()
    }
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:7420".to_string()
}

fn default_display_name() -> String {
    "anonymous".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: None,
            display_name: default_display_name(),
            listen: default_listen(),
            advertise_host: None,
            can_anchor: false,
            is_mobile: false,
            debug: false,
            state_dir: None,
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            frame_timeout_secs: 12,
            phase_timeout_secs: 30,
        }
    }
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            direct_timeout_secs: 20,
            anchor_timeout_secs: 20,
            realtime_timeout_secs: 10,
            store_timeout_secs: 30,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
        }
    }
}

impl Default for AnchorSection {
    fn default() -> Self {
        Self {
            announce_interval_secs: 60,
            stale_after_secs: 20,
            cooldown_secs: 60,
            max_age_hours: 24,
            max_per_channel: 500,
            max_total_mib: 50,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_per_channel: 5000,
            prune_interval_secs: 300,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 60,
            ttl_secs: 600,
            lookup_limit: 32,
            max_attempts: 3,
            peer_ttl_secs: 600,
        }
    }
}

impl SyncSection {
    /// Sync tick interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-frame read deadline.
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    /// Per-phase deadline.
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }
}

impl AnchorSection {
    /// Election hysteresis.
    pub fn policy(&self) -> AnchorPolicy {
        AnchorPolicy {
            stale_after_ms: self.stale_after_secs * 1000,
            cooldown_ms: self.cooldown_secs * 1000,
        }
    }

    /// Anchor store retention.
    pub fn store_policy(&self) -> AnchorStorePolicy {
        AnchorStorePolicy {
            max_age_ms: self.max_age_hours * 60 * 60 * 1000,
            max_per_channel: self.max_per_channel,
            max_total_bytes: self.max_total_mib * 1024 * 1024,
        }
    }
}

impl StoreSection {
    /// Local retention.
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age_ms: (self.max_age_days > 0).then(|| self.max_age_days * 24 * 60 * 60 * 1000),
            max_per_channel: (self.max_per_channel > 0).then_some(self.max_per_channel),
        }
    }
}

impl CircleConfig {
    /// Circle with a hex secret.
    pub fn with_secret(hex: impl Into<String>) -> Self {
        Self {
            secret: Some(hex.into()),
            ..Self::default()
        }
    }

    /// Resolve the configured secret.
    pub fn resolve(&self, index: usize) -> Result<CircleSecret, ConfigError> {
        match (&self.secret, &self.passphrase) {
            (Some(hex), _) if !hex.trim().is_empty() => {
                CircleSecret::from_hex(hex).map_err(|source| ConfigError::InvalidSecret {
                    index,
                    source,
                })
            }
            (_, Some(passphrase)) if !passphrase.is_empty() => {
                CircleSecret::from_passphrase(passphrase)
                    .map_err(|source| ConfigError::InvalidSecret { index, source })
            }
            _ => Err(ConfigError::MissingSecret { index }),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circles.is_empty() {
            return Err(ConfigError::Invalid("no circles configured".into()));
        }
        for (index, circle) in self.circles.iter().enumerate() {
            let has_secret = circle.secret.as_deref().is_some_and(|s| !s.trim().is_empty());
            let has_passphrase = circle.passphrase.as_deref().is_some_and(|p| !p.is_empty());
            if !has_secret && !has_passphrase {
                return Err(ConfigError::MissingSecret { index });
            }
            if has_secret {
                circle.resolve(index)?;
            }
        }
        let timeouts = [
            ("sync.interval_secs", self.sync.interval_secs),
            ("sync.frame_timeout_secs", self.sync.frame_timeout_secs),
            ("sync.phase_timeout_secs", self.sync.phase_timeout_secs),
            ("routing.direct_timeout_secs", self.routing.direct_timeout_secs),
            ("routing.anchor_timeout_secs", self.routing.anchor_timeout_secs),
            ("routing.realtime_timeout_secs", self.routing.realtime_timeout_secs),
            ("routing.store_timeout_secs", self.routing.store_timeout_secs),
            ("anchor.announce_interval_secs", self.anchor.announce_interval_secs),
            ("store.prune_interval_secs", self.store.prune_interval_secs),
            ("discovery.refresh_interval_secs", self.discovery.refresh_interval_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if self.routing.backoff_base_ms == 0 || self.routing.backoff_cap_ms < self.routing.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "routing backoff needs 0 < backoff_base_ms <= backoff_cap_ms".into(),
            ));
        }
        Ok(())
    }

    /// Resolve every circle secret.
    pub fn circle_secrets(&self) -> Result<Vec<CircleSecret>, ConfigError> {
        self.circles
            .iter()
            .enumerate()
            .map(|(index, circle)| circle.resolve(index))
            .collect()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A circle has neither secret nor passphrase.
    #[error("circle #{index} has no secret")]
    MissingSecret {
        /// Position in `[[circles]]`.
        index: usize,
    },
    /// A circle secret does not decode.
    #[error("circle #{index} secret is invalid: {source}")]
    InvalidSecret {
        /// Position in `[[circles]]`.
        index: usize,
        /// Decoding or derivation failure.
        source: CryptoError,
    },
    /// Any other unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.node.listen, "0.0.0.0:7420");
        assert_eq!(config.sync.frame_timeout_secs, 12);
        assert_eq!(config.sync.phase_timeout_secs, 30);
        assert_eq!(config.routing.direct_timeout_secs, 20);
        assert_eq!(config.routing.realtime_timeout_secs, 10);
        assert_eq!(config.routing.store_timeout_secs, 30);
        assert_eq!(config.anchor.announce_interval_secs, 60);
        assert_eq!(config.anchor.store_policy(), AnchorStorePolicy::default());
        assert_eq!(config.anchor.policy(), AnchorPolicy::default());
        assert_eq!(config.store.retention(), RetentionPolicy::default());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[node]
node_id = "n1"
display_name = "alice"
listen = "127.0.0.1:9000"
can_anchor = true
debug = true

[routing]
direct_timeout_secs = 5

[[circles]]
secret = "0101010101010101010101010101010101010101010101010101010101010101"
label = "family"
"#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.node.node_id.as_deref(), Some("n1"));
        assert!(config.node.can_anchor);
        assert!(config.node.debug);
        assert_eq!(config.routing.direct_timeout_secs, 5);
        assert_eq!(config.routing.anchor_timeout_secs, 20);
        assert_eq!(config.circles.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config.sync.interval_secs, 15);
        assert!(config.circles.is_empty());
    }

    #[test]
    fn circle_without_secret_is_rejected() {
        let toml = r#"
[[circles]]
label = "nothing here"
"#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSecret { index: 0 })
        ));
    }

    #[test]
    fn bad_hex_secret_is_rejected() {
        let mut config = NodeConfig::default();
        config.circles.push(CircleConfig::with_secret("abcd"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSecret { index: 0, .. })
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = NodeConfig::default();
        config.circles.push(CircleConfig::with_secret(SECRET));
        config.sync.phase_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn from_file_reads_and_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[circles]]\nsecret = \"{SECRET}\"").unwrap();
        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.circle_secrets().unwrap().len(), 1);

        let missing = NodeConfig::from_file(std::path::Path::new("/nonexistent/mesh.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn debug_redacts_secrets() {
        let circle = CircleConfig::with_secret(SECRET);
        let debug = format!("{:?}", circle);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(SECRET));
    }

    #[test]
    fn retention_zero_disables_limit() {
        let store = StoreSection {
            max_age_days: 0,
            max_per_channel: 0,
            prune_interval_secs: 300,
        };
        assert_eq!(store.retention().max_age_ms, None);
        assert_eq!(store.retention().max_per_channel, None);
    }
}
