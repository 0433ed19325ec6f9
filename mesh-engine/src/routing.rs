//! Tiered routing for one sync attempt.
//!
//! Tiers are tried in a fixed order and the coordinator advances only when
//! a tier fails:
//!
//! 1. [`Tier::Direct`]: gossip round with the target peer
//! 2. [`Tier::CurrentAnchor`]: anchor exchange with the elected anchor
//! 3. [`Tier::NextAnchor`]: anchor exchange with the runner-up
//! 4. [`Tier::RealtimeRelay`]: hosted realtime relay
//! 5. [`Tier::StoreRelay`]: hosted store-and-forward relay
//!
//! A tier with nothing to talk to is recorded as unavailable. Only the
//! failure of every tier is an error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mesh_core::Backoff;
use mesh_types::{now_ms, ChatMessage, NodeId, PeerRecord};
use tokio::sync::Mutex;
use tracing::debug;

use crate::anchor::{self, AnchorReport, MAX_PULL_PAGES, MAX_PUSH_RECORDS};
use crate::circle::{Circle, MarkKey, MergeReport};
use crate::config::NodeConfig;
use crate::relay::{check_record, HostedRelay, RelayError};
use crate::session::{SecureSession, DEFAULT_FRAME_TIMEOUT};
use crate::sync::{self, RoundReport, SyncConfig};
use crate::transport::Transport;
use crate::MeshError;

/// Envelopes per relay push call.
pub const RELAY_PUSH_BATCH: usize = 100;

/// Envelopes per relay pull call.
pub const RELAY_PULL_LIMIT: usize = 200;

/// One step of the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Direct session with the target
    Direct,
    /// Currently elected anchor
    CurrentAnchor,
    /// Next-ranked anchor candidate
    NextAnchor,
    /// Hosted realtime relay
    RealtimeRelay,
    /// Hosted store-and-forward relay
    StoreRelay,
}

impl Tier {
    /// All tiers in routing order.
    pub const ORDER: [Tier; 5] = [
        Tier::Direct,
        Tier::CurrentAnchor,
        Tier::NextAnchor,
        Tier::RealtimeRelay,
        Tier::StoreRelay,
    ];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Direct => "direct",
            Tier::CurrentAnchor => "current-anchor",
            Tier::NextAnchor => "next-anchor",
            Tier::RealtimeRelay => "realtime-relay",
            Tier::StoreRelay => "store-relay",
        };
        f.write_str(name)
    }
}

/// Why a tier did not deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Nothing to try (no endpoint, no anchor, relay not configured...)
    Unavailable(String),
    /// The attempt ran and failed
    Failed(String),
    /// The tier deadline expired
    TimedOut,
}

/// A failed tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    /// Which tier
    pub tier: Tier,
    /// Why
    pub reason: FailureReason,
}

/// What a hosted relay exchange moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Envelopes pushed
    pub pushed: usize,
    /// Merge counters for pulled envelopes
    pub pulled: MergeReport,
}

/// Report of the tier that succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierReport {
    /// Gossip round
    Round(RoundReport),
    /// Anchor exchange
    Anchor(AnchorReport),
    /// Hosted relay exchange
    Relay(RelayReport),
}

/// Successful routing outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingOutcome {
    /// Tier that succeeded
    pub tier: Tier,
    /// Its report
    pub report: TierReport,
    /// Earlier tiers that failed
    pub failures: Vec<TierFailure>,
}

/// Per-tier deadlines and retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Direct tier deadline
    pub direct_timeout: Duration,
    /// Anchor tier deadline (each anchor tier)
    pub anchor_timeout: Duration,
    /// Realtime relay deadline
    pub realtime_timeout: Duration,
    /// Store relay deadline
    pub store_timeout: Duration,
    /// First relay retry delay
    pub backoff_base: Duration,
    /// Relay retry ceiling
    pub backoff_cap: Duration,
    /// Handshake frame deadline
    pub frame_timeout: Duration,
    /// Round tunables
    pub sync: SyncConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            direct_timeout: Duration::from_secs(20),
            anchor_timeout: Duration::from_secs(20),
            realtime_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(30),
            backoff_base: mesh_core::backoff::DEFAULT_BASE,
            backoff_cap: mesh_core::backoff::DEFAULT_CAP,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            sync: SyncConfig::default(),
        }
    }
}

impl RoutingConfig {
    /// Deadlines from the node configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        let routing = &config.routing;
        Self {
            direct_timeout: Duration::from_secs(routing.direct_timeout_secs),
            anchor_timeout: Duration::from_secs(routing.anchor_timeout_secs),
            realtime_timeout: Duration::from_secs(routing.realtime_timeout_secs),
            store_timeout: Duration::from_secs(routing.store_timeout_secs),
            backoff_base: Duration::from_millis(routing.backoff_base_ms),
            backoff_cap: Duration::from_millis(routing.backoff_cap_ms),
            frame_timeout: config.sync.frame_timeout(),
            sync: SyncConfig {
                phase_timeout: config.sync.phase_timeout(),
            },
        }
    }

    fn deadline(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Direct => self.direct_timeout,
            Tier::CurrentAnchor | Tier::NextAnchor => self.anchor_timeout,
            Tier::RealtimeRelay => self.realtime_timeout,
            Tier::StoreRelay => self.store_timeout,
        }
    }
}

struct RelaySlot {
    relay: Arc<dyn HostedRelay>,
    backoff: Mutex<Backoff>,
}

/// Drives the fallback chain for sync attempts.
pub struct RoutingCoordinator {
    transport: Arc<dyn Transport>,
    realtime: Option<RelaySlot>,
    store: Option<RelaySlot>,
    config: RoutingConfig,
}

impl fmt::Debug for RoutingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingCoordinator")
            .field("realtime", &self.realtime.is_some())
            .field("store", &self.store.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl RoutingCoordinator {
    /// Coordinator without hosted relays.
    pub fn new(transport: Arc<dyn Transport>, config: RoutingConfig) -> Self {
        Self {
            transport,
            realtime: None,
            store: None,
            config,
        }
    }

    fn slot(&self, relay: Arc<dyn HostedRelay>) -> RelaySlot {
        RelaySlot {
            relay,
            backoff: Mutex::new(Backoff::new(self.config.backoff_base, self.config.backoff_cap)),
        }
    }

    /// Add a realtime relay.
    pub fn with_realtime_relay(mut self, relay: Arc<dyn HostedRelay>) -> Self {
        self.realtime = Some(self.slot(relay));
        self
    }

    /// Add a store-and-forward relay.
    pub fn with_store_relay(mut self, relay: Arc<dyn HostedRelay>) -> Self {
        self.store = Some(self.slot(relay));
        self
    }

    /// Configured realtime relay.
    pub fn realtime_relay(&self) -> Option<&Arc<dyn HostedRelay>> {
        self.realtime.as_ref().map(|slot| &slot.relay)
    }

    /// Transport used to dial peers.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Deadlines in use.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Run one sync attempt for `circle`, aimed at `target` when given.
    pub async fn sync_with(
        &self,
        circle: &Circle,
        target: Option<&NodeId>,
    ) -> Result<RoutingOutcome, MeshError> {
        let mut failures = Vec::new();
        for tier in Tier::ORDER {
            let deadline = self.config.deadline(tier);
            let attempt = tokio::time::timeout(deadline, self.attempt(tier, circle, target)).await;
            let reason = match attempt {
                Ok(Ok(report)) => {
                    debug!(circle = %circle.circle_id(), %tier, failed = failures.len(), "sync delivered");
                    return Ok(RoutingOutcome {
                        tier,
                        report,
                        failures,
                    });
                }
                Ok(Err(Attempt::Unavailable(why))) => FailureReason::Unavailable(why),
                Ok(Err(Attempt::Failed(e))) => FailureReason::Failed(e.to_string()),
                Err(_) => FailureReason::TimedOut,
            };
            debug!(circle = %circle.circle_id(), %tier, reason = ?reason, "tier failed");
            if reason == FailureReason::TimedOut {
                if let Some(peer) = self.contact(tier, circle, target).await {
                    circle.record_contact(&peer, false, now_ms()).await;
                }
            }
            failures.push(TierFailure { tier, reason });
        }
        debug!(circle = %circle.circle_id(), "all routing tiers failed");
        Err(MeshError::AllTiersFailed(failures))
    }

    /// Peer a direct or anchor tier talks to.
    async fn contact(&self, tier: Tier, circle: &Circle, target: Option<&NodeId>) -> Option<NodeId> {
        match tier {
            Tier::Direct => target.cloned(),
            Tier::CurrentAnchor => circle.current_anchor().await,
            Tier::NextAnchor => circle.next_anchor(now_ms()).await,
            Tier::RealtimeRelay | Tier::StoreRelay => None,
        }
    }

    async fn attempt(
        &self,
        tier: Tier,
        circle: &Circle,
        target: Option<&NodeId>,
    ) -> Result<TierReport, Attempt> {
        let local = circle.local().node_id();
        match tier {
            Tier::Direct => {
                let target = target.ok_or_else(|| Attempt::unavailable("no target"))?;
                let peer = self.known_peer(circle, target).await?;
                let result = self.direct(circle, &peer).await;
                circle.record_contact(target, result.is_ok(), now_ms()).await;
                Ok(TierReport::Round(result?))
            }
            Tier::CurrentAnchor | Tier::NextAnchor => {
                let anchor = if tier == Tier::CurrentAnchor {
                    circle.current_anchor().await
                } else {
                    circle.next_anchor(now_ms()).await
                };
                let anchor = anchor.ok_or_else(|| Attempt::unavailable("no anchor"))?;
                if &anchor == local {
                    return Err(Attempt::unavailable("anchor is self"));
                }
                let peer = self.known_peer(circle, &anchor).await?;
                let result = self.anchor(circle, &peer).await;
                circle.record_contact(&anchor, result.is_ok(), now_ms()).await;
                Ok(TierReport::Anchor(result?))
            }
            Tier::RealtimeRelay | Tier::StoreRelay => {
                let (slot, key) = if tier == Tier::RealtimeRelay {
                    (self.realtime.as_ref(), MarkKey::RealtimeRelay)
                } else {
                    (self.store.as_ref(), MarkKey::StoreRelay)
                };
                let slot = slot.ok_or_else(|| Attempt::unavailable("relay not configured"))?;
                Ok(TierReport::Relay(relay_with_retry(slot, circle, &key).await?))
            }
        }
    }

    async fn known_peer(&self, circle: &Circle, node_id: &NodeId) -> Result<PeerRecord, Attempt> {
        let peer = circle
            .peer(node_id)
            .await
            .ok_or_else(|| Attempt::unavailable("unknown peer"))?;
        if peer.best_endpoint().is_none() {
            return Err(Attempt::unavailable("no endpoint"));
        }
        Ok(peer)
    }

    async fn open(&self, circle: &Circle, peer: &PeerRecord) -> Result<SecureSession, MeshError> {
        let endpoint = peer
            .best_endpoint()
            .ok_or_else(|| MeshError::Protocol("peer has no endpoint".into()))?;
        let conn = self.transport.connect(endpoint).await?;
        let session = SecureSession::initiate(
            conn,
            circle.secret(),
            circle.local().node_id(),
            self.config.frame_timeout,
        )
        .await?;
        if session.peer() != &peer.node_id {
            let found = session.peer().clone();
            session.close().await;
            return Err(MeshError::Protocol(format!(
                "expected {}, reached {found}",
                peer.node_id
            )));
        }
        Ok(session)
    }

    async fn direct(&self, circle: &Circle, peer: &PeerRecord) -> Result<RoundReport, MeshError> {
        let mut session = self.open(circle, peer).await?;
        let result = sync::run_round(&mut session, circle, &self.config.sync).await;
        session.close().await;
        result
    }

    async fn anchor(&self, circle: &Circle, peer: &PeerRecord) -> Result<AnchorReport, MeshError> {
        let mut session = self.open(circle, peer).await?;
        let result = anchor::exchange(&mut session, circle, &self.config.sync).await;
        session.close().await;
        result
    }
}

enum Attempt {
    Unavailable(String),
    Failed(MeshError),
}

impl Attempt {
    fn unavailable(why: &str) -> Self {
        Attempt::Unavailable(why.to_string())
    }
}

impl From<MeshError> for Attempt {
    fn from(e: MeshError) -> Self {
        Attempt::Failed(e)
    }
}

fn retryable(e: &MeshError) -> bool {
    matches!(
        e,
        MeshError::Relay(RelayError::Unavailable) | MeshError::Relay(RelayError::Timeout)
    )
}

/// Relay exchange, retried with backoff until it succeeds or the tier
/// deadline cancels it.
async fn relay_with_retry(
    slot: &RelaySlot,
    circle: &Circle,
    key: &MarkKey,
) -> Result<RelayReport, MeshError> {
    loop {
        match relay_exchange(slot.relay.as_ref(), circle, key).await {
            Ok(report) => {
                slot.backoff.lock().await.reset();
                return Ok(report);
            }
            Err(e) if retryable(&e) => {
                let delay = slot.backoff.lock().await.next_delay();
                debug!(error = %e, delay_ms = delay.as_millis() as u64, "relay retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Push envelopes since the watermark, then pull since the cursor.
pub async fn relay_exchange(
    relay: &dyn HostedRelay,
    circle: &Circle,
    key: &MarkKey,
) -> Result<RelayReport, MeshError> {
    let hint = circle.hint().clone();
    let mut report = RelayReport::default();

    let (pending, seq) = circle.pending_push(key, now_ms(), MAX_PUSH_RECORDS).await;
    let pending: Vec<ChatMessage> = pending
        .into_iter()
        .filter(|m| check_record(m).is_ok())
        .collect();
    for batch in pending.chunks(RELAY_PUSH_BATCH) {
        relay.push(&hint, batch).await?;
    }
    report.pushed = pending.len();
    circle.commit_push(key, seq).await;

    for _ in 0..MAX_PULL_PAGES {
        let since = circle.pull_cursor(key).await;
        let page = relay.pull(&hint, since, RELAY_PULL_LIMIT).await?;
        let drained = page.messages.len() < RELAY_PULL_LIMIT;
        report.pulled.absorb(circle.merge_incoming(page.messages).await);
        circle.commit_pull(key, page.next_cursor).await;
        if drained {
            break;
        }
    }
    Ok(report)
}
