//! Peer directory for one circle.
//!
//! Records arrive from peer exchange and from discovery lookups and are
//! merged by `node_id`. The local node is never stored. Reachability history
//! (the last [`HISTORY_LEN`] direct/anchor outcomes) is kept next to each
//! record but is local knowledge only and never leaves the node.

use std::collections::{HashMap, VecDeque};

use mesh_types::{Capabilities, NodeId, PeerRecord, MAX_HOST_LEN};

/// Outcomes remembered per peer.
pub const HISTORY_LEN: usize = 10;

/// Default time a peer survives without a sighting (10 minutes).
pub const DEFAULT_PEER_TTL_MS: u64 = 10 * 60 * 1000;

/// Result of merging a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Previously unknown peer.
    Added,
    /// Known peer with newer information.
    Updated,
    /// Nothing new.
    Unchanged,
    /// Record describes the local node.
    Ignored,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    record: PeerRecord,
    history: VecDeque<bool>,
}

/// Known peers of a circle.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    local: NodeId,
    ttl_ms: u64,
    peers: HashMap<NodeId, PeerEntry>,
}

impl PeerDirectory {
    /// Create an empty directory for the node `local`.
    pub fn new(local: NodeId, ttl_ms: u64) -> Self {
        Self {
            local,
            ttl_ms,
            peers: HashMap::new(),
        }
    }

    /// Merge a gossiped or discovered record.
    ///
    /// Endpoints keep the most recently observed entries, `last_seen_ts` never
    /// regresses, and capabilities follow whichever side was seen last.
    /// Timestamps from the future are clamped to `now_ms` and endpoints with
    /// hosts longer than [`MAX_HOST_LEN`] are dropped.
    pub fn merge(&mut self, incoming: PeerRecord, now_ms: u64) -> MergeOutcome {
        if incoming.node_id == self.local {
            return MergeOutcome::Ignored;
        }
        let incoming = sanitize(incoming, now_ms);

        let Some(entry) = self.peers.get_mut(&incoming.node_id) else {
            let mut record = PeerRecord::new(
                incoming.node_id.clone(),
                incoming.last_seen_ts,
                incoming.capabilities,
            );
            for ep in incoming.endpoints {
                record.observe_endpoint(ep);
            }
            self.peers.insert(
                record.node_id.clone(),
                PeerEntry {
                    record,
                    history: VecDeque::new(),
                },
            );
            return MergeOutcome::Added;
        };

        let before = entry.record.clone();
        if incoming.last_seen_ts > entry.record.last_seen_ts {
            entry.record.last_seen_ts = incoming.last_seen_ts;
            entry.record.capabilities = incoming.capabilities;
        }
        for ep in incoming.endpoints {
            entry.record.observe_endpoint(ep);
        }

        if entry.record == before {
            MergeOutcome::Unchanged
        } else {
            MergeOutcome::Updated
        }
    }

    /// Refresh `last_seen_ts` after a successful contact.
    pub fn mark_seen(&mut self, node_id: &NodeId, now_ms: u64) {
        if let Some(entry) = self.peers.get_mut(node_id) {
            entry.record.last_seen_ts = entry.record.last_seen_ts.max(now_ms);
        }
    }

    /// Update a peer's capabilities from an authenticated source.
    pub fn set_capabilities(&mut self, node_id: &NodeId, capabilities: Capabilities) {
        if let Some(entry) = self.peers.get_mut(node_id) {
            entry.record.capabilities = capabilities;
        }
    }

    /// Record one direct or anchor outcome.
    pub fn record_outcome(&mut self, node_id: &NodeId, success: bool) {
        if let Some(entry) = self.peers.get_mut(node_id) {
            entry.history.push_back(success);
            while entry.history.len() > HISTORY_LEN {
                entry.history.pop_front();
            }
        }
    }

    /// Success fraction over the remembered outcomes, in permille.
    ///
    /// A peer with no history scores zero.
    pub fn uptime_permille(&self, node_id: &NodeId) -> u16 {
        let Some(entry) = self.peers.get(node_id) else {
            return 0;
        };
        if entry.history.is_empty() {
            return 0;
        }
        let ok = entry.history.iter().filter(|s| **s).count();
        ((ok * 1000) / entry.history.len()) as u16
    }

    /// Drop peers not seen within the TTL. Returns the removed ids.
    pub fn expire(&mut self, now_ms: u64) -> Vec<NodeId> {
        let ttl = self.ttl_ms;
        let expired: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.record.last_seen_ts) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    /// Look up a peer.
    pub fn get(&self, node_id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(node_id).map(|e| &e.record)
    }

    /// All records, sorted by node id. History is not included.
    pub fn records(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> =
            self.peers.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    /// The local node id.
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn sanitize(mut record: PeerRecord, now_ms: u64) -> PeerRecord {
    record.last_seen_ts = record.last_seen_ts.min(now_ms);
    record.endpoints.retain(|ep| ep.host.len() <= MAX_HOST_LEN);
    for ep in &mut record.endpoints {
        ep.observed_ts = ep.observed_ts.min(now_ms);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::Endpoint;

    const NOW: u64 = 1_700_000_000_000;

    fn record(id: &str, seen: u64, port: u16) -> PeerRecord {
        let mut rec = PeerRecord::new(NodeId::new(id), seen, Capabilities::default());
        rec.observe_endpoint(Endpoint::tcp("10.0.0.1", port, seen));
        rec
    }

    fn directory() -> PeerDirectory {
        PeerDirectory::new(NodeId::new("me"), DEFAULT_PEER_TTL_MS)
    }

    #[test]
    fn local_record_never_stored() {
        let mut dir = directory();
        assert_eq!(dir.merge(record("me", 1, 1), NOW), MergeOutcome::Ignored);
        assert!(dir.is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut dir = directory();
        assert_eq!(dir.merge(record("p", 10, 7000), NOW), MergeOutcome::Added);
        assert_eq!(dir.merge(record("p", 10, 7000), NOW), MergeOutcome::Unchanged);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn last_seen_never_regresses() {
        let mut dir = directory();
        dir.merge(record("p", 100, 7000), NOW);
        dir.merge(record("p", 50, 7001), NOW);
        let rec = dir.get(&NodeId::new("p")).unwrap();
        assert_eq!(rec.last_seen_ts, 100);
        // The older endpoint is still learned, just ranked behind.
        assert_eq!(rec.endpoints.len(), 2);
        assert_eq!(rec.endpoints[0].port, 7000);
    }

    #[test]
    fn newer_capabilities_win() {
        let mut dir = directory();
        dir.merge(record("p", 10, 7000), NOW);
        let mut newer = record("p", 20, 7000);
        newer.capabilities.can_anchor = true;
        assert_eq!(dir.merge(newer, NOW), MergeOutcome::Updated);
        assert!(dir.get(&NodeId::new("p")).unwrap().capabilities.can_anchor);
    }

    #[test]
    fn uptime_over_last_ten() {
        let mut dir = directory();
        dir.merge(record("p", 10, 7000), NOW);
        let id = NodeId::new("p");
        for _ in 0..10 {
            dir.record_outcome(&id, false);
        }
        for _ in 0..5 {
            dir.record_outcome(&id, true);
        }
        assert_eq!(dir.uptime_permille(&id), 500);
    }

    #[test]
    fn unknown_peer_has_zero_uptime() {
        assert_eq!(directory().uptime_permille(&NodeId::new("ghost")), 0);
    }

    #[test]
    fn expire_removes_stale_peers() {
        let mut dir = directory();
        dir.merge(record("old", 0, 7000), NOW);
        dir.merge(record("fresh", DEFAULT_PEER_TTL_MS, 7001), NOW);
        let removed = dir.expire(DEFAULT_PEER_TTL_MS + 1);
        assert_eq!(removed, vec![NodeId::new("old")]);
        assert!(dir.get(&NodeId::new("fresh")).is_some());
    }

    #[test]
    fn records_do_not_leak_history() {
        let mut dir = directory();
        dir.merge(record("p", 10, 7000), NOW);
        dir.record_outcome(&NodeId::new("p"), true);
        let json = serde_json::to_string(&dir.records()).unwrap();
        assert!(!json.contains("history"));
    }

    #[test]
    fn future_timestamps_clamped_to_now() {
        let mut dir = directory();
        dir.merge(record("p", u64::MAX, 7000), NOW);
        let rec = dir.get(&NodeId::new("p")).unwrap();
        assert_eq!(rec.last_seen_ts, NOW);
        assert_eq!(rec.endpoints[0].observed_ts, NOW);
        assert_eq!(dir.expire(NOW + DEFAULT_PEER_TTL_MS + 1), vec![NodeId::new("p")]);
    }

    #[test]
    fn overlong_hosts_dropped() {
        let mut dir = directory();
        let mut rec = record("p", 10, 7000);
        rec.endpoints.push(Endpoint::tcp("h".repeat(MAX_HOST_LEN + 1), 7001, 20));
        dir.merge(rec, NOW);
        let stored = dir.get(&NodeId::new("p")).unwrap();
        assert_eq!(stored.endpoints.len(), 1);
        assert_eq!(stored.endpoints[0].port, 7000);
    }
}
