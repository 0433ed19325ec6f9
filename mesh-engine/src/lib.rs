//! # mesh-engine
//!
//! Gossip synchronization engine for circle mesh group chat.
//!
//! Members of a circle share one secret. Every node keeps a full replica of
//! each circle it belongs to and converges with peers through authenticated,
//! encrypted anti-entropy rounds. When no peer answers, the engine falls back
//! to an elected anchor and finally to hosted relays that only ever see
//! sealed envelopes.
//!
//! ## Features
//!
//! - **Authenticated sessions**: HMAC challenge handshake, AES-256-GCM frames
//! - **Sealed envelopes**: message bodies encrypted under a per-circle key
//! - **Fallback routing**: direct → anchor → next anchor → realtime relay → store relay
//! - **Pure core**: state machines live in `mesh-core`, this crate does the I/O
//!
//! ## Example
//!
//! ```ignore
//! use mesh_engine::{MeshNode, NodeConfig, TcpTransport};
//!
//! let config = NodeConfig::from_file(path)?;
//! let node = MeshNode::from_config(&config, Arc::new(TcpTransport::new()))?;
//! node.start();
//!
//! let circle = node.circles()[0].clone();
//! circle.post(&ChannelId::general(), "hi").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod anchor;
pub mod circle;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod events;
pub mod local;
pub mod node;
pub mod relay;
pub mod routing;
pub mod session;
pub mod sync;
pub mod transport;

pub use circle::{Circle, CircleSettings, MarkKey, MergeReport};
pub use config::{ConfigError, NodeConfig};
pub use crypto::{Argon2Params, CircleSecret, CryptoError, KEY_SIZE, NONCE_SIZE};
pub use discovery::{DiscoveryError, DiscoverySource, MemoryDiscovery, Registration};
pub use error::{ErrorKind, MeshError};
pub use events::MeshEvent;
pub use local::LocalNode;
pub use node::{CircleCommand, MeshNode, MeshNodeBuilder, NodeSettings};
pub use relay::{HostedRelay, MemoryRelay, RelayError};
pub use routing::{RoutingConfig, RoutingCoordinator, RoutingOutcome, Tier};
pub use session::SecureSession;
pub use sync::SyncConfig;
pub use transport::{
    Connection, Listener, MemoryNetwork, MockTransport, TcpMeshListener, TcpTransport, Transport,
    TransportError,
};
