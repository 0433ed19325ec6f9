//! Peer, anchor and local identity records.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Maximum endpoints retained per peer record.
pub const MAX_ENDPOINTS: usize = 4;

/// Longest endpoint host accepted from gossip (a full DNS name).
pub const MAX_HOST_LEN: usize = 253;

/// Transport used to reach an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed frames over TCP
    #[default]
    Tcp,
    /// In-process network (tests, simulation)
    Memory,
}

/// Address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    /// IPv4
    #[default]
    V4,
    /// IPv6
    V6,
    /// Not an IP address
    Other,
}

/// Observed NAT classification of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NatClass {
    /// Not yet observed
    #[default]
    Unknown,
    /// Directly reachable
    Open,
    /// Behind NAT, reachable via outbound only
    Restricted,
}

/// A network location where a peer was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP literal
    pub host: String,
    /// Port
    pub port: u16,
    /// Transport kind
    #[serde(default)]
    pub transport: TransportKind,
    /// Address family
    #[serde(default)]
    pub family: AddrFamily,
    /// NAT classification
    #[serde(default)]
    pub nat: NatClass,
    /// When this endpoint was last observed (ms)
    pub observed_ts: u64,
}

impl Endpoint {
    /// TCP endpoint, deriving the family from the host literal.
    pub fn tcp(host: impl Into<String>, port: u16, observed_ts: u64) -> Self {
        let host = host.into();
        let family = match host.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(_)) => AddrFamily::V4,
            Ok(std::net::IpAddr::V6(_)) => AddrFamily::V6,
            Err(_) => AddrFamily::Other,
        };
        Self {
            host,
            port,
            transport: TransportKind::Tcp,
            family,
            nat: NatClass::Unknown,
            observed_ts,
        }
    }

    /// In-memory endpoint addressed by name.
    pub fn memory(name: impl Into<String>, observed_ts: u64) -> Self {
        Self {
            host: name.into(),
            port: 0,
            transport: TransportKind::Memory,
            family: AddrFamily::Other,
            nat: NatClass::Open,
            observed_ts,
        }
    }

    /// Whether two endpoints denote the same location.
    pub fn same_location(&self, other: &Endpoint) -> bool {
        self.host == other.host && self.port == other.port && self.transport == other.transport
    }

    /// `host:port` form used for dialing.
    pub fn address(&self) -> String {
        match self.family {
            AddrFamily::V6 => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Capabilities a node advertises about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    /// Opted in to act as anchor
    #[serde(default)]
    pub can_anchor: bool,
    /// Running on a mobile device
    #[serde(default)]
    pub is_mobile: bool,
    /// Accepted at least one inbound handshake
    #[serde(default)]
    pub public_reachable: bool,
}

impl Capabilities {
    /// Anchor rank tier: `4·public_reachable + 2·can_anchor + !is_mobile`.
    pub fn tier(&self) -> u8 {
        4 * self.public_reachable as u8 + 2 * self.can_anchor as u8 + (!self.is_mobile) as u8
    }
}

/// A known peer of a circle, as gossiped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer node id
    pub node_id: NodeId,
    /// Up to [`MAX_ENDPOINTS`], most recently observed first
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Last time this peer was seen (ms)
    pub last_seen_ts: u64,
    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl PeerRecord {
    /// New record with no endpoints.
    pub fn new(node_id: NodeId, last_seen_ts: u64, capabilities: Capabilities) -> Self {
        Self {
            node_id,
            endpoints: Vec::new(),
            last_seen_ts,
            capabilities,
        }
    }

    /// Record an observed endpoint, keeping the list ordered and bounded.
    ///
    /// An endpoint already present at the same location is replaced only if
    /// the new observation is newer.
    pub fn observe_endpoint(&mut self, endpoint: Endpoint) {
        if let Some(pos) = self
            .endpoints
            .iter()
            .position(|e| e.same_location(&endpoint))
        {
            if self.endpoints[pos].observed_ts >= endpoint.observed_ts {
                return;
            }
            self.endpoints.remove(pos);
        }
        self.endpoints.push(endpoint);
        self.endpoints
            .sort_by(|a, b| b.observed_ts.cmp(&a.observed_ts));
        self.endpoints.truncate(MAX_ENDPOINTS);
    }

    /// Most recently observed endpoint.
    pub fn best_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }
}

/// An advisory record that a node offers to anchor for the circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    /// Announcing node
    pub node_id: NodeId,
    /// Capabilities at announce time
    pub capabilities: Capabilities,
    /// Announcement time (ms)
    pub announced_at: u64,
}

/// The local node's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Immutable node id
    pub node_id: NodeId,
    /// Name carried on authored messages
    pub display_name: String,
    /// Local capabilities
    pub capabilities: Capabilities,
}

impl NodeIdentity {
    /// Fresh record describing this node for peer exchange.
    pub fn peer_record(&self, endpoints: &[Endpoint], now_ms: u64) -> PeerRecord {
        let mut record = PeerRecord::new(self.node_id.clone(), now_ms, self.capabilities);
        for ep in endpoints {
            let mut ep = ep.clone();
            ep.observed_ts = now_ms;
            record.observe_endpoint(ep);
        }
        record
    }
}
