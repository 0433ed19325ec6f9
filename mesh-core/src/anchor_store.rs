//! Ciphertext-only store-and-forward buffer kept by an anchor.
//!
//! Only sealed v2 envelopes are accepted; anything carrying plaintext is
//! refused. Each stored envelope gets a monotonically increasing [`Cursor`]
//! so members can resume pulls. Retention runs on every insert and drops the
//! oldest entries (by `created_ts`) beyond the age, per-channel count and
//! total size limits. The store is volatile and never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use mesh_types::{ChannelId, ChatMessage, CircleId, Cursor, MsgId};
use thiserror::Error;

/// Retention limits for an anchor store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorStorePolicy {
    /// Maximum envelope age (ms)
    pub max_age_ms: u64,
    /// Maximum envelopes per channel
    pub max_per_channel: usize,
    /// Maximum total encoded size (bytes)
    pub max_total_bytes: usize,
}

impl Default for AnchorStorePolicy {
    fn default() -> Self {
        Self {
            max_age_ms: 24 * 60 * 60 * 1000,
            max_per_channel: 500,
            max_total_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Reasons an envelope is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorStoreError {
    /// Not a v2 envelope.
    #[error("anchor store accepts only sealed envelopes")]
    NotEnvelope,
    /// Carries cleartext body fields.
    #[error("envelope carries plaintext")]
    PlaintextBearing,
    /// Belongs to another circle.
    #[error("envelope belongs to another circle")]
    WrongCircle,
}

/// Result of a successful insert call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Stored under this cursor.
    Stored(Cursor),
    /// Already held.
    Duplicate,
    /// Older than the retention window; not stored.
    Expired,
}

/// One page of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPage {
    /// Envelopes in cursor order
    pub messages: Vec<ChatMessage>,
    /// Cursor to pass as `since` next time
    pub next_cursor: Cursor,
    /// More entries remain after this page
    pub more: bool,
}

#[derive(Debug, Clone)]
struct Stored {
    message: ChatMessage,
    size: usize,
}

/// Anchor store for one circle.
#[derive(Debug, Clone)]
pub struct AnchorStore {
    circle_id: CircleId,
    policy: AnchorStorePolicy,
    entries: BTreeMap<Cursor, Stored>,
    by_id: HashMap<MsgId, Cursor>,
    by_channel: HashMap<ChannelId, BTreeSet<(u64, MsgId)>>,
    by_age: BTreeSet<(u64, MsgId)>,
    last_cursor: Cursor,
    total_bytes: usize,
}

impl AnchorStore {
    /// Create an empty store.
    pub fn new(circle_id: CircleId, policy: AnchorStorePolicy) -> Self {
        Self {
            circle_id,
            policy,
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
            by_channel: HashMap::new(),
            by_age: BTreeSet::new(),
            last_cursor: Cursor::zero(),
            total_bytes: 0,
        }
    }

    /// Insert an envelope and apply retention.
    pub fn insert(
        &mut self,
        message: ChatMessage,
        now_ms: u64,
    ) -> Result<StoreOutcome, AnchorStoreError> {
        if message.circle_id != self.circle_id {
            return Err(AnchorStoreError::WrongCircle);
        }
        if !message.is_envelope() || message.enc.is_none() || message.mac.is_some() {
            return Err(AnchorStoreError::NotEnvelope);
        }
        if message.has_plaintext() {
            return Err(AnchorStoreError::PlaintextBearing);
        }
        if self.by_id.contains_key(&message.msg_id) {
            return Ok(StoreOutcome::Duplicate);
        }
        if message.created_ts < now_ms.saturating_sub(self.policy.max_age_ms) {
            return Ok(StoreOutcome::Expired);
        }

        let cursor = self.last_cursor.next();
        self.last_cursor = cursor;
        let key = (message.created_ts, message.msg_id.clone());
        let size = message.encoded_len();

        self.by_id.insert(message.msg_id.clone(), cursor);
        self.by_channel
            .entry(message.channel_id.clone())
            .or_default()
            .insert(key.clone());
        self.by_age.insert(key);
        self.total_bytes += size;
        self.entries.insert(cursor, Stored { message, size });

        self.enforce_retention(now_ms);
        Ok(StoreOutcome::Stored(cursor))
    }

    fn enforce_retention(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.policy.max_age_ms);
        while let Some((ts, id)) = self.by_age.first().cloned() {
            if ts >= cutoff {
                break;
            }
            self.remove(&id);
        }

        let over: Vec<MsgId> = self
            .by_channel
            .values()
            .filter(|index| index.len() > self.policy.max_per_channel)
            .flat_map(|index| {
                index
                    .iter()
                    .take(index.len() - self.policy.max_per_channel)
                    .map(|(_, id)| id.clone())
            })
            .collect();
        for id in over {
            self.remove(&id);
        }

        while self.total_bytes > self.policy.max_total_bytes {
            let Some((_, id)) = self.by_age.first().cloned() else {
                break;
            };
            self.remove(&id);
        }
    }

    fn remove(&mut self, msg_id: &MsgId) {
        let Some(cursor) = self.by_id.remove(msg_id) else {
            return;
        };
        let Some(stored) = self.entries.remove(&cursor) else {
            return;
        };
        let key = (stored.message.created_ts, msg_id.clone());
        if let Some(index) = self.by_channel.get_mut(&stored.message.channel_id) {
            index.remove(&key);
        }
        self.by_age.remove(&key);
        self.total_bytes -= stored.size;
    }

    /// Envelopes with cursor greater than `since`, at most `limit` of them.
    ///
    /// A `limit` of zero means no limit.
    pub fn pull(&self, since: Cursor, limit: usize) -> PullPage {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut range = self
            .entries
            .range((std::ops::Bound::Excluded(since), std::ops::Bound::Unbounded));

        let mut messages = Vec::new();
        let mut next_cursor = since;
        for (cursor, stored) in range.by_ref().take(limit) {
            messages.push(stored.message.clone());
            next_cursor = *cursor;
        }
        let more = range.next().is_some();

        PullPage {
            messages,
            next_cursor,
            more,
        }
    }

    /// Check whether an envelope is held.
    pub fn contains(&self, msg_id: &MsgId) -> bool {
        self.by_id.contains_key(msg_id)
    }

    /// Highest cursor ever assigned.
    pub fn latest_cursor(&self) -> Cursor {
        self.last_cursor
    }

    /// Total encoded size of held envelopes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of held envelopes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
