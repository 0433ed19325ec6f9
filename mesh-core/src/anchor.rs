//! Anchor ranking and election with hysteresis.
//!
//! Ranking is a pure total order over candidates, so every member that sees
//! the same peer data elects the same anchor. The [`AnchorElector`] adds
//! hysteresis on top: a healthy anchor is only replaced by a clearly better
//! one, and not more often than once per cooldown.

use std::cmp::Ordering;

use mesh_types::{Capabilities, NodeId};

/// Default time after which an unseen anchor is considered stale (20 s).
pub const DEFAULT_STALE_AFTER_MS: u64 = 20_000;

/// Default minimum time between voluntary switches (60 s).
pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;

/// Everything ranking needs to know about one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorCandidate {
    /// Candidate node
    pub node_id: NodeId,
    /// Advertised capabilities
    pub capabilities: Capabilities,
    /// Reachability over recent rounds, 0..=1000
    pub uptime_permille: u16,
    /// Last sighting (ms)
    pub last_seen_ts: u64,
}

impl AnchorCandidate {
    /// Rank tier of this candidate.
    pub fn tier(&self) -> u8 {
        self.capabilities.tier()
    }
}

/// Compare two candidates; `Less` means `a` ranks higher.
///
/// Order: `public_reachable`, `can_anchor`, not mobile, uptime, then node id
/// ascending as the final tie-break.
pub fn compare_candidates(a: &AnchorCandidate, b: &AnchorCandidate) -> Ordering {
    let key = |c: &AnchorCandidate| {
        (
            c.capabilities.public_reachable,
            c.capabilities.can_anchor,
            !c.capabilities.is_mobile,
            c.uptime_permille,
        )
    };
    key(b)
        .cmp(&key(a))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Sort candidates best first.
pub fn rank_anchor_candidates(candidates: &[AnchorCandidate]) -> Vec<AnchorCandidate> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(compare_candidates);
    ranked
}

/// Hysteresis parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorPolicy {
    /// Anchor unseen for longer than this is replaced immediately.
    pub stale_after_ms: u64,
    /// Minimum gap between voluntary switches.
    pub cooldown_ms: u64,
}

impl Default for AnchorPolicy {
    fn default() -> Self {
        Self {
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

/// Outcome of one election pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorDecision {
    /// Current anchor (possibly none) stays.
    Keep,
    /// A new anchor was elected.
    Switch {
        /// Previous anchor, if any
        from: Option<NodeId>,
        /// New anchor
        to: NodeId,
    },
    /// The anchor went away and no candidate is left.
    Cleared {
        /// Previous anchor
        from: NodeId,
    },
}

/// Stateful anchor election for one circle.
#[derive(Debug, Clone)]
pub struct AnchorElector {
    policy: AnchorPolicy,
    current: Option<NodeId>,
    last_switch_ms: Option<u64>,
}

impl AnchorElector {
    /// Create an elector with no anchor.
    pub fn new(policy: AnchorPolicy) -> Self {
        Self {
            policy,
            current: None,
            last_switch_ms: None,
        }
    }

    /// Currently elected anchor.
    pub fn current(&self) -> Option<&NodeId> {
        self.current.as_ref()
    }

    /// Candidates that may be elected right now, best first.
    ///
    /// Only nodes that opted in (`can_anchor`) and were seen within the
    /// staleness threshold qualify.
    pub fn eligible(&self, candidates: &[AnchorCandidate], now_ms: u64) -> Vec<AnchorCandidate> {
        let fresh: Vec<AnchorCandidate> = candidates
            .iter()
            .filter(|c| c.capabilities.can_anchor)
            .filter(|c| now_ms.saturating_sub(c.last_seen_ts) <= self.policy.stale_after_ms)
            .cloned()
            .collect();
        rank_anchor_candidates(&fresh)
    }

    /// Best eligible candidate other than the current anchor.
    pub fn next_candidate(&self, candidates: &[AnchorCandidate], now_ms: u64) -> Option<NodeId> {
        self.eligible(candidates, now_ms)
            .into_iter()
            .map(|c| c.node_id)
            .find(|id| Some(id) != self.current.as_ref())
    }

    /// Run one election pass.
    pub fn elect(&mut self, candidates: &[AnchorCandidate], now_ms: u64) -> AnchorDecision {
        let ranked = self.eligible(candidates, now_ms);
        let top = ranked.first();

        let current = self
            .current
            .as_ref()
            .and_then(|id| ranked.iter().find(|c| &c.node_id == id));

        match (current, top) {
            (_, None) => match self.current.take() {
                Some(from) => AnchorDecision::Cleared { from },
                None => AnchorDecision::Keep,
            },
            // No anchor yet, or the current one went stale: replace now.
            (None, Some(top)) => self.switch_to(top.node_id.clone(), now_ms),
            (Some(current), Some(top)) => {
                if top.node_id == current.node_id {
                    return AnchorDecision::Keep;
                }
                let clearly_better = top.tier() > current.tier() + 1;
                let cooled = self
                    .last_switch_ms
                    .map(|t| now_ms.saturating_sub(t) >= self.policy.cooldown_ms)
                    .unwrap_or(true);
                if clearly_better && cooled {
                    self.switch_to(top.node_id.clone(), now_ms)
                } else {
                    AnchorDecision::Keep
                }
            }
        }
    }

    /// Forget the current anchor without touching the cooldown.
    pub fn reset(&mut self) {
        self.current = None;
    }

    fn switch_to(&mut self, to: NodeId, now_ms: u64) -> AnchorDecision {
        let from = self.current.replace(to.clone());
        self.last_switch_ms = Some(now_ms);
        AnchorDecision::Switch { from, to }
    }
}
