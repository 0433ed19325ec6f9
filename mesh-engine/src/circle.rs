//! Runtime state of one circle.
//!
//! A [`Circle`] owns the message store, peer directory, structural view,
//! anchor election and (when the local node anchors) the anchor store, all
//! behind one async `RwLock`. Verification of incoming records happens
//! before the lock is taken; write sections never span network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use mesh_core::{
    AnchorCandidate, AnchorDecision, AnchorElector, AnchorPolicy, AnchorStore, AnchorStorePolicy,
    ChannelInfo, CircleSnapshot, CircleView, ControlEffect, InsertOutcome, MergeOutcome,
    MessageStore, PeerDirectory, PullPage, RetentionPolicy, StoreOutcome, DEFAULT_PEER_TTL_MS,
};
use mesh_types::{
    now_ms, Capabilities, ChannelId, ChatMessage, CircleHint, CircleId, ControlEvent, Cursor,
    MsgId, NodeId, PeerRecord, WireError,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::crypto::{derive_envelope_key, random_bytes, CircleSecret, EnvelopeKey};
use crate::envelope::{self, Draft};
use crate::events::MeshEvent;
use crate::local::LocalNode;
use crate::MeshError;

/// Maximum peer records sent in one exchange.
pub const MAX_GOSSIP_PEERS: usize = 32;

/// Default lifetime of an anchor offer (3 announce intervals).
pub const DEFAULT_ANCHOR_OFFER_TTL_MS: u64 = 3 * 60 * 1000;

/// Per-circle tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircleSettings {
    /// Local store retention
    pub retention: RetentionPolicy,
    /// Election hysteresis
    pub anchor_policy: AnchorPolicy,
    /// Anchor store retention
    pub anchor_store: AnchorStorePolicy,
    /// Directory expiry
    pub peer_ttl_ms: u64,
    /// Anchor offers older than this are dropped
    pub anchor_offer_ttl_ms: u64,
}

impl Default for CircleSettings {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            anchor_policy: AnchorPolicy::default(),
            anchor_store: AnchorStorePolicy::default(),
            peer_ttl_ms: DEFAULT_PEER_TTL_MS,
            anchor_offer_ttl_ms: DEFAULT_ANCHOR_OFFER_TTL_MS,
        }
    }
}

impl CircleSettings {
    /// Settings derived from the node configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            retention: config.store.retention(),
            anchor_policy: config.anchor.policy(),
            anchor_store: config.anchor.store_policy(),
            peer_ttl_ms: config.discovery.peer_ttl_secs * 1000,
            anchor_offer_ttl_ms: 3 * config.anchor.announce_interval_secs * 1000,
        }
    }
}

/// Which remote store a watermark belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkKey {
    /// A peer anchor
    Anchor(NodeId),
    /// The realtime hosted relay
    RealtimeRelay,
    /// The store-and-forward hosted relay
    StoreRelay,
}

/// Push and pull progress against one remote store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMark {
    /// Local insertion sequence already pushed
    pub pushed_seq: u64,
    /// Remote cursor already pulled
    pub pulled: Cursor,
    /// Store epoch the cursors belong to, once an anchor reported one
    pub epoch: Option<u64>,
}

/// Counters from merging a batch of received records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Newly stored
    pub received: usize,
    /// Already held or previously pruned
    pub duplicate: usize,
    /// Failed verification
    pub rejected: usize,
    /// Control events that changed the view
    pub control_applied: usize,
}

impl MergeReport {
    /// Add another report's counters to this one.
    pub fn absorb(&mut self, other: MergeReport) {
        self.received += other.received;
        self.duplicate += other.duplicate;
        self.rejected += other.rejected;
        self.control_applied += other.control_applied;
    }
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Maintenance {
    /// Messages dropped by retention
    pub pruned: usize,
    /// Peers dropped from the directory
    pub expired_peers: usize,
}

enum Applied {
    New { control: bool },
    Duplicate,
    Rejected,
}

struct CircleState {
    store: MessageStore,
    directory: PeerDirectory,
    view: CircleView,
    elector: AnchorElector,
    anchor_store: AnchorStore,
    marks: HashMap<MarkKey, SyncMark>,
}

/// One circle this node belongs to.
pub struct Circle {
    circle_id: CircleId,
    hint: CircleHint,
    secret: CircleSecret,
    envelope_key: EnvelopeKey,
    local: Arc<LocalNode>,
    settings: CircleSettings,
    anchor_epoch: u64,
    state: RwLock<CircleState>,
    events: broadcast::Sender<MeshEvent>,
}

impl std::fmt::Debug for Circle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circle")
            .field("circle_id", &self.circle_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl Circle {
    /// Create the runtime for a circle.
    pub fn new(
        secret: CircleSecret,
        local: Arc<LocalNode>,
        settings: CircleSettings,
        events: broadcast::Sender<MeshEvent>,
    ) -> Result<Self, MeshError> {
        let circle_id = secret.circle_id();
        let envelope_key = derive_envelope_key(&secret, &circle_id)?;
        let state = CircleState {
            store: MessageStore::new(circle_id.clone(), settings.retention),
            directory: PeerDirectory::new(local.node_id().clone(), settings.peer_ttl_ms),
            view: CircleView::new(),
            elector: AnchorElector::new(settings.anchor_policy),
            anchor_store: AnchorStore::new(circle_id.clone(), settings.anchor_store),
            marks: HashMap::new(),
        };
        Ok(Self {
            hint: circle_id.hint(),
            circle_id,
            secret,
            envelope_key,
            local,
            settings,
            anchor_epoch: u64::from_be_bytes(random_bytes::<8>()?),
            state: RwLock::new(state),
            events,
        })
    }

    /// Circle id.
    pub fn circle_id(&self) -> &CircleId {
        &self.circle_id
    }

    /// Lookup hint published to discovery and relays.
    pub fn hint(&self) -> &CircleHint {
        &self.hint
    }

    /// Circle secret.
    pub fn secret(&self) -> &CircleSecret {
        &self.secret
    }

    /// The local node.
    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    // =========================================================================
    // Authoring
    // =========================================================================

    /// Post a message to a user channel.
    pub async fn post(&self, channel: &ChannelId, text: &str) -> Result<ChatMessage, MeshError> {
        self.author(None, channel, text).await
    }

    /// Post with a caller-chosen message id.
    pub async fn post_with_id(
        &self,
        msg_id: MsgId,
        channel: &ChannelId,
        text: &str,
    ) -> Result<ChatMessage, MeshError> {
        self.author(Some(&msg_id), channel, text).await
    }

    /// Post a structural event to the control channel.
    pub async fn post_control(&self, event: &ControlEvent) -> Result<ChatMessage, MeshError> {
        event.validate(self.local.node_id())?;
        let text = event.to_text()?;
        self.compose(None, &ChannelId::control(), &text).await
    }

    /// Announce the local node as an anchor candidate.
    pub async fn announce_anchor(&self) -> Result<Option<ChatMessage>, MeshError> {
        let capabilities = self.local.capabilities().await;
        if !capabilities.can_anchor {
            return Ok(None);
        }
        let event = ControlEvent::AnchorAnnounce(mesh_types::AnchorAnnounce {
            node_id: self.local.node_id().clone(),
            capabilities,
            announced_at: now_ms(),
        });
        self.post_control(&event).await.map(Some)
    }

    async fn author(
        &self,
        msg_id: Option<&MsgId>,
        channel: &ChannelId,
        text: &str,
    ) -> Result<ChatMessage, MeshError> {
        if channel.is_control() {
            return Err(WireError::InvalidData("control channel takes control events".into()).into());
        }
        self.compose(msg_id, channel, text).await
    }

    async fn compose(
        &self,
        msg_id: Option<&MsgId>,
        channel: &ChannelId,
        text: &str,
    ) -> Result<ChatMessage, MeshError> {
        let identity = self.local.identity().await;
        let now = now_ms();
        let draft = Draft {
            msg_id,
            circle_id: &self.circle_id,
            channel_id: channel,
            author: &identity.node_id,
            display_name: &identity.display_name,
            text,
            created_ts: now,
        };
        let message = envelope::compose_v2(&self.envelope_key, &draft)?;

        {
            let mut state = self.state.write().await;
            self.apply(
                &mut state,
                message.clone(),
                identity.capabilities.can_anchor,
                now,
                None,
            );
        }
        debug!(circle = %self.circle_id, msg = %message.msg_id, "posted");
        Ok(message)
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Verify and merge records received from a peer, anchor or relay.
    pub async fn merge_incoming(&self, messages: Vec<ChatMessage>) -> MergeReport {
        self.merge(messages, true, true).await
    }

    /// `mirror` copies new envelopes into the anchor store when this node anchors.
    async fn merge(&self, messages: Vec<ChatMessage>, notify: bool, mirror: bool) -> MergeReport {
        let mut report = MergeReport::default();
        let verified = self.verify_all(messages, &mut report);
        if verified.is_empty() {
            return report;
        }

        let can_anchor = mirror && self.local.capabilities().await.can_anchor;
        let now = now_ms();
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            for message in verified {
                let sink = notify.then_some(&mut events);
                match self.apply(&mut state, message, can_anchor, now, sink) {
                    Applied::New { control } => {
                        report.received += 1;
                        if control {
                            report.control_applied += 1;
                        }
                    }
                    Applied::Duplicate => report.duplicate += 1,
                    Applied::Rejected => report.rejected += 1,
                }
            }
        }
        self.publish(events);
        report
    }

    fn verify_all(&self, messages: Vec<ChatMessage>, report: &mut MergeReport) -> Vec<ChatMessage> {
        let mut verified = Vec::with_capacity(messages.len());
        for message in messages {
            let msg_id = message.msg_id.clone();
            match envelope::open(message, &self.circle_id, &self.secret, &self.envelope_key) {
                Ok(message) => verified.push(message),
                Err(e) => {
                    warn!(circle = %self.circle_id, msg = %msg_id, error = %e, "discarding record");
                    report.rejected += 1;
                }
            }
        }
        verified
    }

    fn apply(
        &self,
        state: &mut CircleState,
        message: ChatMessage,
        can_anchor: bool,
        now: u64,
        events: Option<&mut Vec<MeshEvent>>,
    ) -> Applied {
        match state.store.insert(message.clone()) {
            InsertOutcome::Inserted(_) => {}
            InsertOutcome::Duplicate | InsertOutcome::Pruned => return Applied::Duplicate,
            InsertOutcome::WrongCircle => return Applied::Rejected,
        }

        if let Some(name) = message.display_name.as_deref() {
            state.view.learn_display_name(
                &message.author_node_id,
                name,
                message.created_ts,
                &message.msg_id,
            );
        }
        if can_anchor && message.is_envelope() {
            if let Err(e) = state.anchor_store.insert(message.sealed(), now) {
                debug!(msg = %message.msg_id, error = %e, "not mirrored to anchor store");
            }
        }

        let mut control = false;
        let mut event = None;
        if message.channel_id.is_control() {
            let parsed = message
                .text
                .as_deref()
                .and_then(|text| ControlEvent::parse(text, &message.author_node_id));
            if let Some(parsed) = parsed {
                match state
                    .view
                    .apply_control(&parsed, message.created_ts, &message.msg_id)
                {
                    ControlEffect::Superseded => {}
                    ControlEffect::AnchorAnnounced(node_id) => {
                        if let ControlEvent::AnchorAnnounce(offer) = &parsed {
                            state.directory.set_capabilities(&node_id, offer.capabilities);
                        }
                        control = true;
                    }
                    ControlEffect::CallSignal(call) => {
                        event = Some(MeshEvent::CallSignal {
                            circle_id: self.circle_id.clone(),
                            from: message.author_node_id.clone(),
                            call,
                        });
                        control = true;
                    }
                    ControlEffect::ChannelChanged(_) | ControlEffect::CircleRenamed(_) => {
                        control = true;
                    }
                }
            }
        } else {
            event = Some(MeshEvent::MessageReceived {
                circle_id: self.circle_id.clone(),
                message,
            });
        }

        if let (Some(events), Some(event)) = (events, event) {
            events.push(event);
        }
        Applied::New { control }
    }

    fn publish(&self, events: impl IntoIterator<Item = MeshEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Ids held locally.
    pub async fn digest(&self) -> Vec<MsgId> {
        self.state.read().await.store.ids()
    }

    /// Ids in `remote` this node lacks.
    pub async fn missing_from(&self, remote: &[MsgId]) -> Vec<MsgId> {
        self.state.read().await.store.missing_from(remote)
    }

    /// Sealed copies of the requested messages; unknown ids are skipped.
    pub async fn outbound(&self, ids: &[MsgId]) -> Vec<ChatMessage> {
        let state = self.state.read().await;
        let mut seen = std::collections::HashSet::new();
        ids.iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| state.store.get(id).map(ChatMessage::sealed))
            .collect()
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Records to send in a peer exchange: local first, then the freshest peers.
    pub async fn peer_exchange(&self, now: u64) -> Vec<PeerRecord> {
        let local = self.local.peer_record(now).await;
        let mut others = self.state.read().await.directory.records();
        others.sort_by(|a, b| b.last_seen_ts.cmp(&a.last_seen_ts));

        let mut records = Vec::with_capacity(MAX_GOSSIP_PEERS);
        records.push(local);
        records.extend(others.into_iter().take(MAX_GOSSIP_PEERS - 1));
        records
    }

    /// Merge gossiped peer records. Returns how many were new.
    pub async fn merge_peers(&self, records: Vec<PeerRecord>) -> usize {
        let now = now_ms();
        let mut added = Vec::new();
        {
            let mut state = self.state.write().await;
            for record in records {
                let node_id = record.node_id.clone();
                if state.directory.merge(record, now) == MergeOutcome::Added {
                    added.extend(state.directory.get(&node_id).cloned());
                }
            }
        }
        let count = added.len();
        for peer in added {
            info!(circle = %self.circle_id, peer = %peer.node_id, "peer discovered");
            self.publish([MeshEvent::PeerDiscovered {
                circle_id: self.circle_id.clone(),
                peer,
            }]);
        }
        count
    }

    /// Record the outcome of dialing `node_id`.
    pub async fn record_contact(&self, node_id: &NodeId, success: bool, now: u64) {
        let mut state = self.state.write().await;
        state.directory.record_outcome(node_id, success);
        if success {
            state.directory.mark_seen(node_id, now);
        }
    }

    /// A known peer.
    pub async fn peer(&self, node_id: &NodeId) -> Option<PeerRecord> {
        self.state.read().await.directory.get(node_id).cloned()
    }

    /// All known peers.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.state.read().await.directory.records()
    }

    // =========================================================================
    // Anchors
    // =========================================================================

    fn candidates(
        state: &CircleState,
        local: &NodeId,
        capabilities: Capabilities,
        now: u64,
    ) -> Vec<AnchorCandidate> {
        let mut candidates: Vec<AnchorCandidate> = state
            .directory
            .records()
            .into_iter()
            .filter(|r| r.capabilities.can_anchor)
            .map(|r| AnchorCandidate {
                uptime_permille: state.directory.uptime_permille(&r.node_id),
                node_id: r.node_id,
                capabilities: r.capabilities,
                last_seen_ts: r.last_seen_ts,
            })
            .collect();
        if capabilities.can_anchor {
            candidates.push(AnchorCandidate {
                node_id: local.clone(),
                capabilities,
                uptime_permille: 1000,
                last_seen_ts: now,
            });
        }
        candidates
    }

    /// Run one election pass.
    pub async fn elect(&self, now: u64) -> AnchorDecision {
        let capabilities = self.local.capabilities().await;
        let decision = {
            let mut state = self.state.write().await;
            let candidates = Self::candidates(&state, self.local.node_id(), capabilities, now);
            state.elector.elect(&candidates, now)
        };
        let anchor = match &decision {
            AnchorDecision::Keep => return decision,
            AnchorDecision::Switch { from, to } => {
                info!(circle = %self.circle_id, from = ?from, to = %to, "anchor switched");
                Some(to.clone())
            }
            AnchorDecision::Cleared { from } => {
                info!(circle = %self.circle_id, from = %from, "anchor cleared");
                None
            }
        };
        self.publish([MeshEvent::AnchorChanged {
            circle_id: self.circle_id.clone(),
            anchor,
        }]);
        decision
    }

    /// Currently elected anchor.
    pub async fn current_anchor(&self) -> Option<NodeId> {
        self.state.read().await.elector.current().cloned()
    }

    /// Best eligible candidate other than the current anchor.
    pub async fn next_anchor(&self, now: u64) -> Option<NodeId> {
        let capabilities = self.local.capabilities().await;
        let state = self.state.read().await;
        let candidates = Self::candidates(&state, self.local.node_id(), capabilities, now);
        state.elector.next_candidate(&candidates, now)
    }

    /// Random id of this process's anchor store. A restarted anchor starts
    /// with an empty store and a new epoch.
    pub fn anchor_epoch(&self) -> u64 {
        self.anchor_epoch
    }

    /// Store envelopes pushed by a member. Returns newly stored count and latest cursor.
    ///
    /// The anchor store takes ciphertext after shape and circle checks only.
    /// The local view then merges the same batch like any received records.
    pub async fn anchor_accept(&self, messages: Vec<ChatMessage>) -> (u32, Cursor, MergeReport) {
        let now = now_ms();
        let mut accepted = 0u32;
        let cursor = {
            let mut state = self.state.write().await;
            for message in &messages {
                if let Err(e) = message.validate_shape() {
                    debug!(msg = %message.msg_id, error = %e, "push refused");
                    continue;
                }
                match state.anchor_store.insert(message.sealed(), now) {
                    Ok(StoreOutcome::Stored(_)) => accepted += 1,
                    Ok(_) => {}
                    Err(e) => debug!(msg = %message.msg_id, error = %e, "push refused"),
                }
            }
            state.anchor_store.latest_cursor()
        };
        let report = self.merge(messages, true, false).await;
        (accepted, cursor, report)
    }

    /// Page through the anchor store.
    pub async fn anchor_pull(&self, since: Cursor, limit: usize) -> PullPage {
        self.state.read().await.anchor_store.pull(since, limit)
    }

    /// Up to `limit` sealed envelopes inserted after the push watermark for
    /// `key`, within the anchor retention window, plus the sequence to commit
    /// afterwards.
    pub async fn pending_push(
        &self,
        key: &MarkKey,
        now: u64,
        limit: usize,
    ) -> (Vec<ChatMessage>, u64) {
        let state = self.state.read().await;
        let mark = state.marks.get(key).copied().unwrap_or_default();
        let cutoff = now.saturating_sub(self.settings.anchor_store.max_age_ms);
        let mut messages = Vec::new();
        let mut last = mark.pushed_seq;
        for (seq, message) in state.store.inserted_since(mark.pushed_seq) {
            if messages.len() == limit {
                break;
            }
            last = seq;
            if message.is_envelope() && message.created_ts >= cutoff {
                messages.push(message.sealed());
            }
        }
        (messages, last)
    }

    /// Advance the push watermark.
    pub async fn commit_push(&self, key: &MarkKey, seq: u64) {
        let mut state = self.state.write().await;
        let mark = state.marks.entry(key.clone()).or_default();
        mark.pushed_seq = mark.pushed_seq.max(seq);
    }

    /// Pull cursor for `key`.
    pub async fn pull_cursor(&self, key: &MarkKey) -> Cursor {
        let state = self.state.read().await;
        state.marks.get(key).map(|m| m.pulled).unwrap_or_default()
    }

    /// Advance the pull cursor.
    pub async fn commit_pull(&self, key: &MarkKey, cursor: Cursor) {
        let mut state = self.state.write().await;
        let mark = state.marks.entry(key.clone()).or_default();
        if cursor > mark.pulled {
            mark.pulled = cursor;
        }
    }

    /// Note the store epoch `key` reported. When it differs from the epoch
    /// the watermarks were taken against, both are reset and `true` is
    /// returned.
    pub async fn observe_epoch(&self, key: &MarkKey, epoch: u64) -> bool {
        let mut state = self.state.write().await;
        let mark = state.marks.entry(key.clone()).or_default();
        let changed = mark.epoch.is_some_and(|known| known != epoch);
        if changed {
            *mark = SyncMark::default();
        }
        mark.epoch = Some(epoch);
        changed
    }

    // =========================================================================
    // Maintenance and persistence
    // =========================================================================

    /// Apply retention and expire stale peers and anchor offers.
    pub async fn maintain(&self, now: u64) -> Maintenance {
        let mut state = self.state.write().await;
        let pruned = state.store.prune(now);
        let expired = state.directory.expire(now);
        state.view.expire_anchors(now, self.settings.anchor_offer_ttl_ms);
        if pruned > 0 || !expired.is_empty() {
            debug!(circle = %self.circle_id, pruned, expired = expired.len(), "maintenance");
        }
        Maintenance {
            pruned,
            expired_peers: expired.len(),
        }
    }

    /// Snapshot for persistence. Messages are sealed.
    pub async fn snapshot(&self) -> CircleSnapshot {
        let state = self.state.read().await;
        CircleSnapshot::new(
            self.circle_id.clone(),
            state.store.all().into_iter().cloned(),
            state.directory.records(),
            state.view.anchors(),
        )
    }

    /// Restore a snapshot. Every message is verified again.
    pub async fn restore(&self, snapshot: CircleSnapshot) -> Result<MergeReport, MeshError> {
        if snapshot.circle_id != self.circle_id {
            return Err(MeshError::UnknownCircle(snapshot.circle_id));
        }
        let report = self.merge(snapshot.messages, false, true).await;
        let now = now_ms();
        let mut state = self.state.write().await;
        for peer in snapshot.peers {
            state.directory.merge(peer, now);
        }
        for anchor in snapshot.anchors {
            state.view.record_anchor(anchor);
        }
        Ok(report)
    }

    // =========================================================================
    // Readers
    // =========================================================================

    /// Messages of a channel in display order, with plaintext.
    pub async fn messages(&self, channel: &ChannelId) -> Vec<ChatMessage> {
        let state = self.state.read().await;
        state
            .store
            .channel_messages(channel)
            .into_iter()
            .cloned()
            .collect()
    }

    /// A message by id.
    pub async fn message(&self, msg_id: &MsgId) -> Option<ChatMessage> {
        self.state.read().await.store.get(msg_id).cloned()
    }

    /// Whether the store holds `msg_id`.
    pub async fn contains(&self, msg_id: &MsgId) -> bool {
        self.state.read().await.store.contains(msg_id)
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.state.read().await.store.len()
    }

    /// Active channels.
    pub async fn channels(&self) -> Vec<ChannelInfo> {
        self.state.read().await.view.channels()
    }

    /// Circle name, if set.
    pub async fn name(&self) -> Option<String> {
        self.state.read().await.view.name().map(str::to_string)
    }

    /// Latest known display name for an author.
    pub async fn display_name(&self, author: &NodeId) -> Option<String> {
        let state = self.state.read().await;
        state.view.display_name(author).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{CallEvent, ChannelAction, ChannelEvent};

    fn local(name: &str, can_anchor: bool) -> Arc<LocalNode> {
        let caps = Capabilities {
            can_anchor,
            ..Capabilities::default()
        };
        Arc::new(LocalNode::new(NodeId::new(name), name, caps))
    }

    fn circle(name: &str, can_anchor: bool) -> (Circle, broadcast::Receiver<MeshEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let circle = Circle::new(
            CircleSecret::from_bytes([9u8; 32]),
            local(name, can_anchor),
            CircleSettings::default(),
            tx,
        )
        .unwrap();
        (circle, rx)
    }

    // ===========================================
    // Authoring and merging
    // ===========================================

    #[tokio::test]
    async fn post_then_merge_elsewhere() {
        let (alice, _) = circle("alice", false);
        let (bob, mut events) = circle("bob", false);

        let msg = alice.post(&ChannelId::general(), "hello").await.unwrap();
        let outbound = alice.outbound(&[msg.msg_id.clone()]).await;
        assert!(!outbound[0].has_plaintext());

        let report = bob.merge_incoming(outbound).await;
        assert_eq!(report.received, 1);
        let stored = bob.message(&msg.msg_id).await.unwrap();
        assert_eq!(stored.text.as_deref(), Some("hello"));
        assert_eq!(bob.display_name(&NodeId::new("alice")).await.as_deref(), Some("alice"));

        match events.try_recv().unwrap() {
            MeshEvent::MessageReceived { message, .. } => assert_eq!(message.msg_id, msg.msg_id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_merge_is_counted() {
        let (alice, _) = circle("alice", false);
        let (bob, _) = circle("bob", false);
        let msg = alice.post(&ChannelId::general(), "once").await.unwrap();
        let outbound = alice.outbound(&[msg.msg_id]).await;

        bob.merge_incoming(outbound.clone()).await;
        let second = bob.merge_incoming(outbound).await;
        assert_eq!(second.received, 0);
        assert_eq!(second.duplicate, 1);
        assert_eq!(bob.message_count().await, 1);
    }

    #[tokio::test]
    async fn tampered_record_rejected() {
        let (alice, _) = circle("alice", false);
        let (bob, _) = circle("bob", false);
        let msg = alice.post(&ChannelId::general(), "x").await.unwrap();
        let mut outbound = alice.outbound(&[msg.msg_id.clone()]).await;
        outbound[0].created_ts += 5;

        let report = bob.merge_incoming(outbound).await;
        assert_eq!(report.rejected, 1);
        assert!(!bob.contains(&msg.msg_id).await);
    }

    #[tokio::test]
    async fn plain_post_to_control_channel_refused() {
        let (alice, _) = circle("alice", false);
        assert!(alice.post(&ChannelId::control(), "{}").await.is_err());
    }

    #[tokio::test]
    async fn outbound_skips_unknown_and_repeats() {
        let (alice, _) = circle("alice", false);
        let msg = alice.post(&ChannelId::general(), "x").await.unwrap();
        let ids = vec![msg.msg_id.clone(), MsgId::new(), msg.msg_id];
        assert_eq!(alice.outbound(&ids).await.len(), 1);
    }

    // ===========================================
    // Control events
    // ===========================================

    #[tokio::test]
    async fn channel_event_applies_on_both_sides() {
        let (alice, _) = circle("alice", false);
        let (bob, _) = circle("bob", false);
        let event = ControlEvent::Channel(ChannelEvent {
            channel_id: ChannelId::new("random"),
            action: ChannelAction::Create,
            name: "Random".into(),
        });
        let msg = alice.post_control(&event).await.unwrap();
        assert!(alice.channels().await.iter().any(|c| c.name == "Random"));

        let report = bob.merge_incoming(alice.outbound(&[msg.msg_id]).await).await;
        assert_eq!(report.control_applied, 1);
        assert!(bob.channels().await.iter().any(|c| c.name == "Random"));
    }

    #[tokio::test]
    async fn call_signal_forwarded_to_subscribers() {
        let (alice, _) = circle("alice", false);
        let (bob, mut events) = circle("bob", false);
        let event = ControlEvent::Call(CallEvent {
            call_id: "c1".into(),
            kind: "offer".into(),
            payload: serde_json::json!({"sdp": "v=0"}),
        });
        let msg = alice.post_control(&event).await.unwrap();
        bob.merge_incoming(alice.outbound(&[msg.msg_id]).await).await;

        match events.try_recv().unwrap() {
            MeshEvent::CallSignal { from, call, .. } => {
                assert_eq!(from, NodeId::new("alice"));
                assert_eq!(call.call_id, "c1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // ===========================================
    // Peers and anchors
    // ===========================================

    #[tokio::test]
    async fn peer_exchange_leads_with_local() {
        let (alice, mut events) = circle("alice", false);
        let added = alice
            .merge_peers(vec![PeerRecord::new(NodeId::new("bob"), 10, Capabilities::default())])
            .await;
        assert_eq!(added, 1);
        assert!(matches!(events.try_recv().unwrap(), MeshEvent::PeerDiscovered { .. }));

        let records = alice.peer_exchange(20).await;
        assert_eq!(records[0].node_id, NodeId::new("alice"));
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn local_anchor_candidate_elected() {
        let (alice, mut events) = circle("alice", true);
        let decision = alice.elect(1_000).await;
        assert!(matches!(decision, AnchorDecision::Switch { .. }));
        assert_eq!(alice.current_anchor().await, Some(NodeId::new("alice")));
        assert!(matches!(
            events.try_recv().unwrap(),
            MeshEvent::AnchorChanged { anchor: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn non_anchor_peers_not_elected() {
        let (alice, _) = circle("alice", false);
        let now = now_ms();
        alice
            .merge_peers(vec![PeerRecord::new(NodeId::new("bob"), now, Capabilities::default())])
            .await;
        assert!(matches!(alice.elect(now).await, AnchorDecision::Keep));
        assert_eq!(alice.current_anchor().await, None);
    }

    #[tokio::test]
    async fn anchor_accepts_and_serves_pushes() {
        let (member, _) = circle("member", false);
        let (anchor, _) = circle("anchor", true);
        member.post(&ChannelId::general(), "one").await.unwrap();
        member.post(&ChannelId::general(), "two").await.unwrap();

        let key = MarkKey::Anchor(NodeId::new("anchor"));
        let (pending, seq) = member.pending_push(&key, now_ms(), usize::MAX).await;
        assert_eq!(pending.len(), 2);

        let (accepted, cursor, report) = anchor.anchor_accept(pending).await;
        assert_eq!(accepted, 2);
        assert_eq!(report.received, 2);
        assert_eq!(cursor, Cursor::new(2));

        member.commit_push(&key, seq).await;
        assert!(member.pending_push(&key, now_ms(), usize::MAX).await.0.is_empty());

        let page = anchor.anchor_pull(Cursor::zero(), 1).await;
        assert_eq!(page.messages.len(), 1);
        assert!(page.more);
        assert!(!page.messages[0].has_plaintext());
    }

    #[tokio::test]
    async fn anchor_stores_ciphertext_it_cannot_open() {
        let (member, _) = circle("member", false);
        let (anchor, _) = circle("anchor", true);
        member.post(&ChannelId::general(), "sealed").await.unwrap();
        let key = MarkKey::Anchor(NodeId::new("anchor"));
        let (mut pending, _) = member.pending_push(&key, now_ms(), usize::MAX).await;
        if let Some(enc) = pending[0].enc.as_mut() {
            enc.ciphertext = "AAAAAAAAAAAAAAAAAAAAAAAA".into();
        }

        let (accepted, _, report) = anchor.anchor_accept(pending).await;
        assert_eq!(accepted, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(anchor.message_count().await, 0);
        assert_eq!(anchor.anchor_pull(Cursor::zero(), 0).await.messages.len(), 1);
    }

    #[tokio::test]
    async fn pending_push_is_bounded() {
        let (member, _) = circle("member", false);
        for i in 0..5 {
            member.post(&ChannelId::general(), &format!("m{i}")).await.unwrap();
        }
        let key = MarkKey::Anchor(NodeId::new("anchor"));
        let (first, seq) = member.pending_push(&key, now_ms(), 3).await;
        assert_eq!(first.len(), 3);
        member.commit_push(&key, seq).await;
        let (rest, _) = member.pending_push(&key, now_ms(), 3).await;
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn epoch_change_resets_marks() {
        let (alice, _) = circle("alice", false);
        let key = MarkKey::Anchor(NodeId::new("anchor"));
        assert!(!alice.observe_epoch(&key, 1).await);
        alice.commit_pull(&key, Cursor::new(10)).await;
        assert!(!alice.observe_epoch(&key, 1).await);
        assert_eq!(alice.pull_cursor(&key).await, Cursor::new(10));

        assert!(alice.observe_epoch(&key, 2).await);
        assert_eq!(alice.pull_cursor(&key).await, Cursor::zero());
        assert!(!alice.observe_epoch(&key, 2).await);
    }

    #[tokio::test]
    async fn pull_cursor_only_moves_forward() {
        let (alice, _) = circle("alice", false);
        let key = MarkKey::StoreRelay;
        alice.commit_pull(&key, Cursor::new(5)).await;
        alice.commit_pull(&key, Cursor::new(3)).await;
        assert_eq!(alice.pull_cursor(&key).await, Cursor::new(5));
    }

    // ===========================================
    // Persistence
    // ===========================================

    #[tokio::test]
    async fn snapshot_restores_verified_state() {
        let (alice, _) = circle("alice", false);
        let msg = alice.post(&ChannelId::general(), "persist me").await.unwrap();
        let snapshot = alice.snapshot().await;
        assert!(snapshot.messages.iter().all(|m| !m.has_plaintext()));

        let (restored, mut events) = circle("alice", false);
        let report = restored.restore(snapshot).await.unwrap();
        assert_eq!(report.received, 1);
        let back = restored.message(&msg.msg_id).await.unwrap();
        assert_eq!(back.text.as_deref(), Some("persist me"));
        assert!(events.try_recv().is_err());
    }
}
