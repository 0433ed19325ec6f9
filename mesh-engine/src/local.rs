//! The local node's identity, shared by every circle it belongs to.

use mesh_types::{Capabilities, Endpoint, NodeId, NodeIdentity, PeerRecord};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Profile {
    display_name: String,
    capabilities: Capabilities,
    endpoints: Vec<Endpoint>,
}

/// Identity of this node. The node id never changes for the process lifetime.
#[derive(Debug)]
pub struct LocalNode {
    node_id: NodeId,
    profile: RwLock<Profile>,
}

impl LocalNode {
    /// Create a local node.
    pub fn new(node_id: NodeId, display_name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            node_id,
            profile: RwLock::new(Profile {
                display_name: display_name.into(),
                capabilities,
                endpoints: Vec::new(),
            }),
        }
    }

    /// Node id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Current identity snapshot.
    pub async fn identity(&self) -> NodeIdentity {
        let profile = self.profile.read().await;
        NodeIdentity {
            node_id: self.node_id.clone(),
            display_name: profile.display_name.clone(),
            capabilities: profile.capabilities,
        }
    }

    /// Current capabilities.
    pub async fn capabilities(&self) -> Capabilities {
        self.profile.read().await.capabilities
    }

    /// Change the display name carried on future messages.
    pub async fn set_display_name(&self, name: impl Into<String>) {
        self.profile.write().await.display_name = name.into();
    }

    /// Add an endpoint other nodes can dial.
    pub async fn add_endpoint(&self, endpoint: Endpoint) {
        let mut profile = self.profile.write().await;
        profile.endpoints.retain(|e| !e.same_location(&endpoint));
        profile.endpoints.insert(0, endpoint);
    }

    /// Flip `public_reachable` after an inbound handshake. Returns true on change.
    pub async fn mark_public_reachable(&self) -> bool {
        let mut profile = self.profile.write().await;
        let changed = !profile.capabilities.public_reachable;
        profile.capabilities.public_reachable = true;
        changed
    }

    /// Fresh record of this node for peer exchange.
    pub async fn peer_record(&self, now_ms: u64) -> PeerRecord {
        let endpoints = self.profile.read().await.endpoints.clone();
        self.identity().await.peer_record(&endpoints, now_ms)
    }
}
