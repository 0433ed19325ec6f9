//! Nonce/timestamp replay protection for discovery requests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default acceptance window around the receiver's clock (±5 minutes).
pub const DEFAULT_REPLAY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Freshness proof attached to every discovery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStamp {
    /// Hex of 16 random bytes
    pub nonce: String,
    /// Sender clock (ms)
    pub timestamp_ms: u64,
}

impl RequestStamp {
    /// New stamp with a random nonce.
    pub fn fresh(now_ms: u64) -> Self {
        let mut bytes = [0u8; 16];
        // All-zero on RNG failure.
        let _ = getrandom::getrandom(&mut bytes);
        Self {
            nonce: hex::encode(bytes),
            timestamp_ms: now_ms,
        }
    }
}

/// Why a stamp was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// Timestamp outside the window.
    #[error("request timestamp outside the accepted window")]
    Stale,
    /// Nonce already used within the window.
    #[error("request nonce replayed")]
    Replayed,
}

/// Remembers nonces seen within the window.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    window_ms: u64,
    seen: HashMap<String, u64>,
}

impl ReplayGuard {
    /// Create a guard with the given window.
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            seen: HashMap::new(),
        }
    }

    /// Accept a stamp once; refuse stale or repeated ones.
    pub fn check(&mut self, stamp: &RequestStamp, now_ms: u64) -> Result<(), ReplayError> {
        if now_ms.abs_diff(stamp.timestamp_ms) > self.window_ms {
            return Err(ReplayError::Stale);
        }

        let window = self.window_ms;
        self.seen
            .retain(|_, seen_at| now_ms.saturating_sub(*seen_at) <= window * 2);

        if self.seen.contains_key(&stamp.nonce) {
            return Err(ReplayError::Replayed);
        }
        self.seen.insert(stamp.nonce.clone(), now_ms);
        Ok(())
    }

    /// Number of remembered nonces.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if no nonces are remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn accepts_fresh_stamp_once() {
        let mut guard = ReplayGuard::default();
        let stamp = RequestStamp::fresh(NOW);
        assert_eq!(guard.check(&stamp, NOW), Ok(()));
        assert_eq!(guard.check(&stamp, NOW + 1), Err(ReplayError::Replayed));
    }

    #[test]
    fn rejects_outside_window_both_directions() {
        let mut guard = ReplayGuard::default();
        let past = RequestStamp::fresh(NOW - DEFAULT_REPLAY_WINDOW_MS - 1);
        let future = RequestStamp::fresh(NOW + DEFAULT_REPLAY_WINDOW_MS + 1);
        assert_eq!(guard.check(&past, NOW), Err(ReplayError::Stale));
        assert_eq!(guard.check(&future, NOW), Err(ReplayError::Stale));
    }

    #[test]
    fn accepts_edge_of_window() {
        let mut guard = ReplayGuard::default();
        let edge = RequestStamp::fresh(NOW - DEFAULT_REPLAY_WINDOW_MS);
        assert!(guard.check(&edge, NOW).is_ok());
    }

    #[test]
    fn forgets_old_nonces() {
        let mut guard = ReplayGuard::default();
        guard.check(&RequestStamp::fresh(NOW), NOW).unwrap();
        let later = NOW + DEFAULT_REPLAY_WINDOW_MS * 3;
        guard.check(&RequestStamp::fresh(later), later).unwrap();
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn fresh_nonces_differ() {
        assert_ne!(RequestStamp::fresh(NOW).nonce, RequestStamp::fresh(NOW).nonce);
    }
}
