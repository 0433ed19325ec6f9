//! Rendezvous discovery by circle hint.
//!
//! Nodes register their endpoints under each circle's hint with a TTL and
//! look up other members by the same hint. Every mutating request carries a
//! [`RequestStamp`] that the service checks with a [`ReplayGuard`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::{ReplayError, ReplayGuard, RequestStamp};
use mesh_types::{now_ms, Capabilities, CircleHint, Endpoint, NodeId, PeerRecord};
use thiserror::Error;
use tokio::sync::Mutex;

/// Discovery errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// The service could not be reached.
    #[error("discovery unavailable")]
    Unavailable,

    /// Stamp was stale or already used.
    #[error("request refused: {0}")]
    Replay(#[from] ReplayError),

    /// The service refused the request.
    #[error("discovery rejected request: {0}")]
    Rejected(String),
}

/// A node announcing itself for one circle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Registering node
    pub node_id: NodeId,
    /// Circle hint
    pub circle_hint: CircleHint,
    /// Dialable endpoints
    pub endpoints: Vec<Endpoint>,
    /// Advertised capabilities
    pub capabilities: Capabilities,
    /// Lifetime of the registration (ms)
    pub ttl_ms: u64,
    /// Freshness proof
    pub stamp: RequestStamp,
}

impl Registration {
    /// Registration for `record` under `hint`, stamped now.
    pub fn from_record(record: &PeerRecord, hint: CircleHint, ttl_ms: u64, now: u64) -> Self {
        Self {
            node_id: record.node_id.clone(),
            circle_hint: hint,
            endpoints: record.endpoints.clone(),
            capabilities: record.capabilities,
            ttl_ms,
            stamp: RequestStamp::fresh(now),
        }
    }

    fn record(&self, seen_at: u64) -> PeerRecord {
        let mut record = PeerRecord::new(self.node_id.clone(), seen_at, self.capabilities);
        for endpoint in &self.endpoints {
            record.observe_endpoint(endpoint.clone());
        }
        record
    }
}

/// A discovery service.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Register or refresh a node under a hint.
    async fn register(&self, registration: Registration) -> Result<(), DiscoveryError>;

    /// Members registered under `hint`, freshest first, at most `limit`.
    async fn lookup(&self, hint: &CircleHint, limit: usize)
        -> Result<Vec<PeerRecord>, DiscoveryError>;

    /// Remove a registration.
    async fn unregister(
        &self,
        node_id: &NodeId,
        hint: &CircleHint,
        stamp: RequestStamp,
    ) -> Result<(), DiscoveryError>;
}

#[derive(Debug)]
struct Entry {
    registration: Registration,
    registered_at: u64,
}

#[derive(Debug)]
struct Inner {
    available: bool,
    guard: ReplayGuard,
    entries: HashMap<CircleHint, HashMap<NodeId, Entry>>,
}

/// In-process discovery service.
#[derive(Debug, Clone)]
pub struct MemoryDiscovery {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDiscovery {
    /// Create an empty service with the default replay window.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                guard: ReplayGuard::default(),
                entries: HashMap::new(),
            })),
        }
    }

    /// Make the service reachable or not.
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.available = available;
    }
}

#[async_trait]
impl DiscoverySource for MemoryDiscovery {
    async fn register(&self, registration: Registration) -> Result<(), DiscoveryError> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        if !inner.available {
            return Err(DiscoveryError::Unavailable);
        }
        if registration.ttl_ms == 0 {
            return Err(DiscoveryError::Rejected("zero ttl".into()));
        }
        inner.guard.check(&registration.stamp, now)?;
        inner
            .entries
            .entry(registration.circle_hint.clone())
            .or_default()
            .insert(
                registration.node_id.clone(),
                Entry {
                    registration,
                    registered_at: now,
                },
            );
        Ok(())
    }

    async fn lookup(
        &self,
        hint: &CircleHint,
        limit: usize,
    ) -> Result<Vec<PeerRecord>, DiscoveryError> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        if !inner.available {
            return Err(DiscoveryError::Unavailable);
        }
        let Some(members) = inner.entries.get_mut(hint) else {
            return Ok(Vec::new());
        };
        members.retain(|_, e| now.saturating_sub(e.registered_at) < e.registration.ttl_ms);

        let mut found: Vec<&Entry> = members.values().collect();
        found.sort_by(|a, b| {
            b.registered_at
                .cmp(&a.registered_at)
                .then_with(|| a.registration.node_id.cmp(&b.registration.node_id))
        });
        Ok(found
            .into_iter()
            .take(limit)
            .map(|e| e.registration.record(e.registered_at))
            .collect())
    }

    async fn unregister(
        &self,
        node_id: &NodeId,
        hint: &CircleHint,
        stamp: RequestStamp,
    ) -> Result<(), DiscoveryError> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        if !inner.available {
            return Err(DiscoveryError::Unavailable);
        }
        inner.guard.check(&stamp, now)?;
        if let Some(members) = inner.entries.get_mut(hint) {
            members.remove(node_id);
        }
        Ok(())
    }
}
