//! Hosted relays: opaque envelope stores addressed by circle hint.
//!
//! A relay never sees the circle id or any key. Members push sealed v2
//! envelopes and pull them back by cursor. Relays refuse legacy records,
//! anything carrying plaintext, and oversized records; a batch containing
//! any such record is refused as a whole.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mesh_types::{now_ms, ChatMessage, CircleHint, Cursor, MsgId, MAX_RECORD_BYTES};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Largest encoded record a relay accepts; the same cap authoring enforces.
pub const MAX_RELAY_RECORD_BYTES: usize = MAX_RECORD_BYTES;

/// Relay errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The relay could not be reached.
    #[error("relay unavailable")]
    Unavailable,

    /// The relay refused the request.
    #[error("relay rejected request: {0}")]
    Rejected(String),

    /// A record exceeds the relay size limit.
    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge {
        /// Encoded size
        size: usize,
        /// Limit
        max: usize,
    },

    /// The relay did not answer in time.
    #[error("relay timed out")]
    Timeout,
}

/// One pull response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPull {
    /// Envelopes after the requested cursor
    pub messages: Vec<ChatMessage>,
    /// Cursor to resume from
    pub next_cursor: Cursor,
    /// Relay clock at response time (ms)
    pub server_time: u64,
}

/// Check that a record may be handed to a relay.
pub fn check_record(message: &ChatMessage) -> Result<(), RelayError> {
    if !message.is_envelope() || message.mac.is_some() {
        return Err(RelayError::Rejected("legacy record".into()));
    }
    if message.has_plaintext() {
        return Err(RelayError::Rejected("record carries plaintext".into()));
    }
    let size = message.encoded_len();
    if size > MAX_RELAY_RECORD_BYTES {
        return Err(RelayError::RecordTooLarge {
            size,
            max: MAX_RELAY_RECORD_BYTES,
        });
    }
    Ok(())
}

/// A hosted relay service.
#[async_trait]
pub trait HostedRelay: Send + Sync {
    /// Store envelopes. Returns how many were new.
    async fn push(&self, hint: &CircleHint, messages: &[ChatMessage]) -> Result<usize, RelayError>;

    /// Envelopes stored after `since`, at most `limit` (0 = no limit).
    async fn pull(
        &self,
        hint: &CircleHint,
        since: Cursor,
        limit: usize,
    ) -> Result<RelayPull, RelayError>;

    /// Notifications of new envelopes, for relays that push them.
    fn subscribe(&self) -> Option<broadcast::Receiver<CircleHint>> {
        None
    }
}

#[derive(Debug, Default)]
struct RelayLog {
    entries: Vec<(Cursor, ChatMessage)>,
    ids: HashSet<MsgId>,
    last: Cursor,
}

#[derive(Debug)]
struct Inner {
    available: bool,
    delay: Duration,
    logs: HashMap<CircleHint, RelayLog>,
}

/// In-process relay, used by tests and single-host deployments.
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    inner: Arc<Mutex<Inner>>,
    notify: Option<broadcast::Sender<CircleHint>>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    /// Store-and-forward relay without notifications.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                delay: Duration::ZERO,
                logs: HashMap::new(),
            })),
            notify: None,
        }
    }

    /// Realtime relay that notifies subscribers on every push.
    pub fn realtime() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            notify: Some(tx),
            ..Self::new()
        }
    }

    /// Make the relay reachable or not.
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.available = available;
    }

    /// Delay every request, to exercise deadlines.
    pub async fn set_delay(&self, delay: Duration) {
        self.inner.lock().await.delay = delay;
    }

    /// Records held for `hint`.
    pub async fn stored(&self, hint: &CircleHint) -> Vec<ChatMessage> {
        let inner = self.inner.lock().await;
        inner
            .logs
            .get(hint)
            .map(|log| log.entries.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    async fn gate(&self) -> Result<(), RelayError> {
        let (available, delay) = {
            let inner = self.inner.lock().await;
            (inner.available, inner.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if available {
            Ok(())
        } else {
            Err(RelayError::Unavailable)
        }
    }
}

#[async_trait]
impl HostedRelay for MemoryRelay {
    async fn push(&self, hint: &CircleHint, messages: &[ChatMessage]) -> Result<usize, RelayError> {
        self.gate().await?;
        for message in messages {
            check_record(message)?;
        }

        let added = {
            let mut inner = self.inner.lock().await;
            let log = inner.logs.entry(hint.clone()).or_default();
            let mut added = 0;
            for message in messages {
                if log.ids.insert(message.msg_id.clone()) {
                    log.last = log.last.next();
                    log.entries.push((log.last, message.clone()));
                    added += 1;
                }
            }
            added
        };

        if added > 0 {
            if let Some(notify) = &self.notify {
                // No subscribers is fine
                let _ = notify.send(hint.clone());
            }
        }
        Ok(added)
    }

    async fn pull(
        &self,
        hint: &CircleHint,
        since: Cursor,
        limit: usize,
    ) -> Result<RelayPull, RelayError> {
        self.gate().await?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let inner = self.inner.lock().await;
        let mut next_cursor = since;
        let mut messages = Vec::new();
        if let Some(log) = inner.logs.get(hint) {
            for (cursor, message) in log.entries.iter().filter(|(c, _)| *c > since).take(limit) {
                messages.push(message.clone());
                next_cursor = *cursor;
            }
        }
        Ok(RelayPull {
            messages,
            next_cursor,
            server_time: now_ms(),
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<CircleHint>> {
        self.notify.as_ref().map(|tx| tx.subscribe())
    }
}
