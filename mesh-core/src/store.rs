//! Message store for one circle.
//!
//! Append-only set of messages keyed by [`MsgId`] with a per-channel index
//! ordered by `(created_ts, msg_id)`. Inserts are idempotent, so merging the
//! same message from several peers or rounds leaves the store unchanged.
//!
//! Every insert also gets a local sequence number. The sequence is what anchor
//! pushes use as a watermark; it is never sent on the wire.
//!
//! Pruning drops old messages by age and by per-channel count. Pruned ids are
//! remembered (bounded) so digest exchange does not request them again. The
//! `__control` channel is never pruned because it carries the derived state.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use mesh_types::{ChannelId, ChatMessage, CircleId, MsgId};

/// How many pruned ids are remembered.
pub const PRUNED_MEMORY: usize = 10_000;

/// Age and count limits for the message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Drop messages older than this (ms). `None` keeps forever.
    pub max_age_ms: Option<u64>,
    /// Keep at most this many messages per channel. `None` is unbounded.
    pub max_per_channel: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: Some(30 * 24 * 60 * 60 * 1000),
            max_per_channel: Some(5000),
        }
    }
}

/// Result of inserting a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New message stored with the given local sequence number.
    Inserted(u64),
    /// Already held.
    Duplicate,
    /// Previously pruned locally; not re-added.
    Pruned,
    /// Belongs to a different circle.
    WrongCircle,
}

#[derive(Debug, Clone)]
struct Entry {
    message: ChatMessage,
    seq: u64,
}

/// Messages held by a node for one circle.
#[derive(Debug, Clone)]
pub struct MessageStore {
    circle_id: CircleId,
    policy: RetentionPolicy,
    messages: HashMap<MsgId, Entry>,
    by_channel: HashMap<ChannelId, BTreeSet<(u64, MsgId)>>,
    by_seq: BTreeMap<u64, MsgId>,
    next_seq: u64,
    pruned: HashSet<MsgId>,
    pruned_order: VecDeque<MsgId>,
}

impl MessageStore {
    /// Create an empty store for `circle_id`.
    pub fn new(circle_id: CircleId, policy: RetentionPolicy) -> Self {
        Self {
            circle_id,
            policy,
            messages: HashMap::new(),
            by_channel: HashMap::new(),
            by_seq: BTreeMap::new(),
            next_seq: 1,
            pruned: HashSet::new(),
            pruned_order: VecDeque::new(),
        }
    }

    /// Circle this store belongs to.
    pub fn circle_id(&self) -> &CircleId {
        &self.circle_id
    }

    /// Insert a verified message.
    ///
    /// The circle check runs first; a message from another circle is never
    /// stored regardless of anything else about it.
    pub fn insert(&mut self, message: ChatMessage) -> InsertOutcome {
        if message.circle_id != self.circle_id {
            return InsertOutcome::WrongCircle;
        }
        if self.messages.contains_key(&message.msg_id) {
            return InsertOutcome::Duplicate;
        }
        if self.pruned.contains(&message.msg_id) {
            return InsertOutcome::Pruned;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_channel
            .entry(message.channel_id.clone())
            .or_default()
            .insert((message.created_ts, message.msg_id.clone()));
        self.by_seq.insert(seq, message.msg_id.clone());
        self.messages
            .insert(message.msg_id.clone(), Entry { message, seq });
        InsertOutcome::Inserted(seq)
    }

    /// Check whether a message is held.
    pub fn contains(&self, msg_id: &MsgId) -> bool {
        self.messages.contains_key(msg_id)
    }

    /// Check whether a message was pruned locally.
    pub fn was_pruned(&self, msg_id: &MsgId) -> bool {
        self.pruned.contains(msg_id)
    }

    /// Look up a message.
    pub fn get(&self, msg_id: &MsgId) -> Option<&ChatMessage> {
        self.messages.get(msg_id).map(|e| &e.message)
    }

    /// All held ids, sorted for stable digests.
    pub fn ids(&self) -> Vec<MsgId> {
        let mut ids: Vec<MsgId> = self.messages.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids from a peer's digest that we neither hold nor pruned.
    pub fn missing_from(&self, remote: &[MsgId]) -> Vec<MsgId> {
        let mut seen = HashSet::new();
        remote
            .iter()
            .filter(|id| !self.contains(id) && !self.was_pruned(id))
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Messages of a channel ordered by `(created_ts, msg_id)`.
    pub fn channel_messages(&self, channel_id: &ChannelId) -> Vec<&ChatMessage> {
        self.by_channel
            .get(channel_id)
            .map(|index| {
                index
                    .iter()
                    .filter_map(|(_, id)| self.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Channels that hold at least one message.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .by_channel
            .iter()
            .filter(|(_, index)| !index.is_empty())
            .map(|(c, _)| c.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Messages inserted after local sequence `seq`, in insertion order.
    pub fn inserted_since(&self, seq: u64) -> Vec<(u64, &ChatMessage)> {
        self.by_seq
            .range(seq.saturating_add(1)..)
            .filter_map(|(s, id)| self.get(id).map(|m| (*s, m)))
            .collect()
    }

    /// Highest sequence number assigned so far (0 when empty).
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Every held message, ordered by `(created_ts, msg_id)`.
    pub fn all(&self) -> Vec<&ChatMessage> {
        let mut all: Vec<&ChatMessage> = self.messages.values().map(|e| &e.message).collect();
        all.sort_by(|a, b| (a.created_ts, &a.msg_id).cmp(&(b.created_ts, &b.msg_id)));
        all
    }

    /// Apply the retention policy. Returns the number of messages dropped.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let mut doomed: Vec<MsgId> = Vec::new();

        for (channel, index) in &self.by_channel {
            if channel.is_control() {
                continue;
            }
            let mut survivors = index.len();
            if let Some(max_age) = self.policy.max_age_ms {
                let cutoff = now_ms.saturating_sub(max_age);
                for (ts, id) in index.iter() {
                    if *ts >= cutoff {
                        break;
                    }
                    doomed.push(id.clone());
                    survivors -= 1;
                }
            }
            if let Some(max) = self.policy.max_per_channel {
                if survivors > max {
                    let skip = index.len() - survivors;
                    doomed.extend(
                        index
                            .iter()
                            .skip(skip)
                            .take(survivors - max)
                            .map(|(_, id)| id.clone()),
                    );
                }
            }
        }

        for id in &doomed {
            self.remove(id);
        }
        doomed.len()
    }

    fn remove(&mut self, msg_id: &MsgId) {
        let Some(entry) = self.messages.remove(msg_id) else {
            return;
        };
        if let Some(index) = self.by_channel.get_mut(&entry.message.channel_id) {
            index.remove(&(entry.message.created_ts, msg_id.clone()));
        }
        self.by_seq.remove(&entry.seq);

        if self.pruned.insert(msg_id.clone()) {
            self.pruned_order.push_back(msg_id.clone());
        }
        while self.pruned_order.len() > PRUNED_MEMORY {
            if let Some(old) = self.pruned_order.pop_front() {
                self.pruned.remove(&old);
            }
        }
    }

    /// Number of held messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
