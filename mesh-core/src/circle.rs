//! State derived from the `__control` channel and from authored messages.
//!
//! Control events are applied last-writer-wins on `(created_ts, msg_id)`, so
//! every member converges to the same channel list and circle name no matter
//! in which order gossip delivers the events.

use std::collections::{BTreeMap, HashMap};

use mesh_types::{
    AnchorRecord, CallEvent, ChannelAction, ChannelId, ControlEvent, MsgId, NodeId,
};

/// Last-writer-wins version of a derived value.
pub type Version = (u64, MsgId);

fn genesis() -> Version {
    (0, MsgId::from_string(""))
}

/// A channel as seen by the circle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel id
    pub channel_id: ChannelId,
    /// Display name
    pub name: String,
    /// Archived channels are hidden but keep their history
    pub archived: bool,
    version: Version,
}

/// What applying a control event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEffect {
    /// A channel was created, renamed or archived.
    ChannelChanged(ChannelId),
    /// The circle was renamed.
    CircleRenamed(String),
    /// An anchor offer was recorded.
    AnchorAnnounced(NodeId),
    /// A call signal to forward untouched.
    CallSignal(CallEvent),
    /// Older than what is already applied.
    Superseded,
}

/// Derived, convergent view of a circle.
#[derive(Debug, Clone)]
pub struct CircleView {
    channels: BTreeMap<ChannelId, ChannelInfo>,
    name: Option<(String, Version)>,
    anchors: HashMap<NodeId, AnchorRecord>,
    display_names: HashMap<NodeId, (String, Version)>,
}

impl CircleView {
    /// Fresh view with only the default channel.
    pub fn new() -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(
            ChannelId::general(),
            ChannelInfo {
                channel_id: ChannelId::general(),
                name: ChannelId::general().to_string(),
                archived: false,
                version: genesis(),
            },
        );
        Self {
            channels,
            name: None,
            anchors: HashMap::new(),
            display_names: HashMap::new(),
        }
    }

    /// Apply a validated control event carried by message `(created_ts, msg_id)`.
    pub fn apply_control(
        &mut self,
        event: &ControlEvent,
        created_ts: u64,
        msg_id: &MsgId,
    ) -> ControlEffect {
        let version: Version = (created_ts, msg_id.clone());
        match event {
            ControlEvent::Channel(evt) => {
                let info = self
                    .channels
                    .entry(evt.channel_id.clone())
                    .or_insert_with(|| ChannelInfo {
                        channel_id: evt.channel_id.clone(),
                        name: evt.channel_id.to_string(),
                        archived: false,
                        version: genesis(),
                    });
                if version <= info.version {
                    return ControlEffect::Superseded;
                }
                info.version = version;
                match evt.action {
                    ChannelAction::Create | ChannelAction::Rename => {
                        info.name = evt.name.clone();
                        info.archived = false;
                    }
                    ChannelAction::Archive => info.archived = true,
                }
                ControlEffect::ChannelChanged(evt.channel_id.clone())
            }
            ControlEvent::CircleName(evt) => {
                if let Some((_, current)) = &self.name {
                    if &version <= current {
                        return ControlEffect::Superseded;
                    }
                }
                self.name = Some((evt.name.clone(), version));
                ControlEffect::CircleRenamed(evt.name.clone())
            }
            ControlEvent::AnchorAnnounce(evt) => {
                let record = AnchorRecord {
                    node_id: evt.node_id.clone(),
                    capabilities: evt.capabilities,
                    announced_at: evt.announced_at,
                };
                self.record_anchor(record)
            }
            ControlEvent::Call(evt) => ControlEffect::CallSignal(evt.clone()),
        }
    }

    /// Record an anchor offer, keeping the newest per node.
    pub fn record_anchor(&mut self, record: AnchorRecord) -> ControlEffect {
        match self.anchors.get(&record.node_id) {
            Some(existing) if existing.announced_at >= record.announced_at => {
                ControlEffect::Superseded
            }
            _ => {
                let node_id = record.node_id.clone();
                self.anchors.insert(node_id.clone(), record);
                ControlEffect::AnchorAnnounced(node_id)
            }
        }
    }

    /// Learn an author's display name; the latest `created_ts` wins.
    pub fn learn_display_name(
        &mut self,
        author: &NodeId,
        name: &str,
        created_ts: u64,
        msg_id: &MsgId,
    ) {
        let version: Version = (created_ts, msg_id.clone());
        match self.display_names.get(author) {
            Some((_, current)) if current >= &version => {}
            _ => {
                self.display_names
                    .insert(author.clone(), (name.to_string(), version));
            }
        }
    }

    /// Drop anchor offers older than `ttl_ms`.
    pub fn expire_anchors(&mut self, now_ms: u64, ttl_ms: u64) {
        self.anchors
            .retain(|_, r| now_ms.saturating_sub(r.announced_at) <= ttl_ms);
    }

    /// Active (not archived) channels, sorted by id.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.channels
            .values()
            .filter(|c| !c.archived)
            .cloned()
            .collect()
    }

    /// Look up a channel, archived or not.
    pub fn channel(&self, channel_id: &ChannelId) -> Option<&ChannelInfo> {
        self.channels.get(channel_id)
    }

    /// Current circle name, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|(n, _)| n.as_str())
    }

    /// Known anchor offers.
    pub fn anchors(&self) -> Vec<AnchorRecord> {
        let mut anchors: Vec<AnchorRecord> = self.anchors.values().cloned().collect();
        anchors.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        anchors
    }

    /// Latest known display name of an author.
    pub fn display_name(&self, author: &NodeId) -> Option<&str> {
        self.display_names.get(author).map(|(n, _)| n.as_str())
    }
}

impl Default for CircleView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{AnchorAnnounce, Capabilities, ChannelEvent, CircleNameEvent};

    fn channel_evt(action: ChannelAction, id: &str, name: &str) -> ControlEvent {
        ControlEvent::Channel(ChannelEvent {
            action,
            channel_id: ChannelId::new(id),
            name: name.into(),
        })
    }

    fn mid(s: &str) -> MsgId {
        MsgId::from_string(s)
    }

    #[test]
    fn starts_with_general() {
        let view = CircleView::new();
        let channels = view.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel_id, ChannelId::general());
    }

    #[test]
    fn channel_lifecycle() {
        let mut view = CircleView::new();
        view.apply_control(&channel_evt(ChannelAction::Create, "dev", "Dev"), 1, &mid("a"));
        view.apply_control(&channel_evt(ChannelAction::Rename, "dev", "Engineering"), 2, &mid("b"));
        assert_eq!(view.channel(&ChannelId::new("dev")).unwrap().name, "Engineering");

        view.apply_control(&channel_evt(ChannelAction::Archive, "dev", ""), 3, &mid("c"));
        assert!(view.channels().iter().all(|c| c.channel_id.as_str() != "dev"));
        assert!(view.channel(&ChannelId::new("dev")).unwrap().archived);
    }

    #[test]
    fn lww_is_order_independent() {
        let older = channel_evt(ChannelAction::Rename, "dev", "Old");
        let newer = channel_evt(ChannelAction::Rename, "dev", "New");

        let mut forward = CircleView::new();
        forward.apply_control(&older, 10, &mid("a"));
        forward.apply_control(&newer, 20, &mid("b"));

        let mut backward = CircleView::new();
        backward.apply_control(&newer, 20, &mid("b"));
        let effect = backward.apply_control(&older, 10, &mid("a"));

        assert_eq!(effect, ControlEffect::Superseded);
        assert_eq!(
            forward.channel(&ChannelId::new("dev")),
            backward.channel(&ChannelId::new("dev"))
        );
    }

    #[test]
    fn msg_id_breaks_timestamp_ties() {
        let mut view = CircleView::new();
        let rename = |name: &str| ControlEvent::CircleName(CircleNameEvent { name: name.into() });
        view.apply_control(&rename("zeta"), 5, &mid("b"));
        view.apply_control(&rename("alpha"), 5, &mid("a"));
        assert_eq!(view.name(), Some("zeta"));
    }

    #[test]
    fn anchor_announce_keeps_newest() {
        let mut view = CircleView::new();
        let announce = |at| {
            ControlEvent::AnchorAnnounce(AnchorAnnounce {
                node_id: NodeId::new("anchor"),
                capabilities: Capabilities {
                    can_anchor: true,
                    ..Capabilities::default()
                },
                announced_at: at,
            })
        };
        view.apply_control(&announce(100), 100, &mid("a"));
        assert_eq!(
            view.apply_control(&announce(50), 50, &mid("b")),
            ControlEffect::Superseded
        );
        assert_eq!(view.anchors()[0].announced_at, 100);

        view.expire_anchors(1000, 500);
        assert!(view.anchors().is_empty());
    }

    #[test]
    fn display_name_latest_wins() {
        let mut view = CircleView::new();
        let author = NodeId::new("a");
        view.learn_display_name(&author, "new", 20, &mid("2"));
        view.learn_display_name(&author, "old", 10, &mid("1"));
        assert_eq!(view.display_name(&author), Some("new"));
    }

    #[test]
    fn call_events_are_forwarded() {
        let mut view = CircleView::new();
        let call = CallEvent {
            call_id: "c".into(),
            kind: "offer".into(),
            payload: serde_json::json!({"sdp": "v=0"}),
        };
        let effect = view.apply_control(&ControlEvent::Call(call.clone()), 1, &mid("x"));
        assert_eq!(effect, ControlEffect::CallSignal(call));
    }
}
