//! Node runtime: circles, inbound sessions and periodic tasks.
//!
//! A [`MeshNode`] holds every circle the local node belongs to. It answers
//! inbound sessions on any number of listeners and, once started, runs one
//! driver task per circle. Periodic tickers (sync, anchor announce,
//! maintenance, discovery refresh) send [`CircleCommand`]s to the driver
//! over an mpsc channel rather than touching circle state themselves.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use mesh_core::{Backoff, CircleSnapshot, RequestStamp};
use mesh_types::{now_ms, Capabilities, CircleId, Frame, NodeId, PeerRecord};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::anchor;
use crate::circle::{Circle, CircleSettings, MarkKey};
use crate::config::NodeConfig;
use crate::crypto::CircleSecret;
use crate::discovery::{DiscoverySource, Registration};
use crate::events::{MeshEvent, EVENT_CAPACITY};
use crate::local::LocalNode;
use crate::relay::HostedRelay;
use crate::routing::{relay_exchange, RoutingConfig, RoutingCoordinator, RoutingOutcome};
use crate::session::SecureSession;
use crate::sync;
use crate::transport::{Connection, Listener, Transport};
use crate::MeshError;

/// Queue depth of a circle driver.
const DRIVER_QUEUE: usize = 32;

/// Work item for a circle driver.
#[derive(Debug, Clone)]
pub enum CircleCommand {
    /// Run election and one routed sync attempt
    SyncTick,
    /// Post an anchor announce if opted in
    AnnounceTick,
    /// Apply retention and expiry
    MaintainTick,
    /// Peers found through discovery
    Discovered(Vec<PeerRecord>),
    /// The realtime relay has new envelopes
    RelayNotified,
}

/// Node-wide timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    /// Per-circle tunables
    pub circle: CircleSettings,
    /// Routing deadlines
    pub routing: RoutingConfig,
    /// Sync tick period
    pub sync_interval: Duration,
    /// Anchor announce period
    pub announce_interval: Duration,
    /// Maintenance period
    pub maintain_interval: Duration,
    /// Discovery refresh period
    pub discovery_refresh: Duration,
    /// Lifetime of discovery registrations
    pub discovery_ttl: Duration,
    /// Maximum peers per lookup
    pub lookup_limit: usize,
    /// Discovery attempts per refresh
    pub discovery_attempts: u32,
    /// Use a discovery source when one is supplied
    pub discovery_enabled: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

impl NodeSettings {
    /// Timing from the node configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            circle: CircleSettings::from_config(config),
            routing: RoutingConfig::from_config(config),
            sync_interval: config.sync.interval(),
            announce_interval: Duration::from_secs(config.anchor.announce_interval_secs),
            maintain_interval: Duration::from_secs(config.store.prune_interval_secs),
            discovery_refresh: Duration::from_secs(config.discovery.refresh_interval_secs),
            discovery_ttl: Duration::from_secs(config.discovery.ttl_secs),
            lookup_limit: config.discovery.lookup_limit,
            discovery_attempts: config.discovery.max_attempts,
            discovery_enabled: config.discovery.enabled,
        }
    }
}

struct Inner {
    local: Arc<LocalNode>,
    settings: NodeSettings,
    circles: DashMap<CircleId, Arc<Circle>>,
    drivers: DashMap<CircleId, mpsc::Sender<CircleCommand>>,
    routing: RoutingCoordinator,
    discovery: Option<Arc<dyn DiscoverySource>>,
    events: broadcast::Sender<MeshEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    next_target: AtomicUsize,
}

/// Builder for [`MeshNode`].
pub struct MeshNodeBuilder {
    local: LocalNode,
    transport: Arc<dyn Transport>,
    settings: NodeSettings,
    discovery: Option<Arc<dyn DiscoverySource>>,
    realtime: Option<Arc<dyn HostedRelay>>,
    store: Option<Arc<dyn HostedRelay>>,
}

impl MeshNodeBuilder {
    /// Replace the default timing.
    pub fn settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a discovery service.
    pub fn discovery(mut self, discovery: Arc<dyn DiscoverySource>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Use a realtime relay.
    pub fn realtime_relay(mut self, relay: Arc<dyn HostedRelay>) -> Self {
        self.realtime = Some(relay);
        self
    }

    /// Use a store-and-forward relay.
    pub fn store_relay(mut self, relay: Arc<dyn HostedRelay>) -> Self {
        self.store = Some(relay);
        self
    }

    /// Build the node. Nothing runs until [`MeshNode::serve`] or [`MeshNode::start`].
    pub fn build(self) -> MeshNode {
        let mut routing = RoutingCoordinator::new(self.transport, self.settings.routing);
        if let Some(relay) = self.realtime {
            routing = routing.with_realtime_relay(relay);
        }
        if let Some(relay) = self.store {
            routing = routing.with_store_relay(relay);
        }
        let enabled = self.settings.discovery_enabled;
        let discovery = self.discovery.filter(|_| enabled);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        MeshNode {
            inner: Arc::new(Inner {
                local: Arc::new(self.local),
                settings: self.settings,
                circles: DashMap::new(),
                drivers: DashMap::new(),
                routing,
                discovery,
                events,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                next_target: AtomicUsize::new(0),
            }),
        }
    }
}

/// A running mesh node. Cheap to clone.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("node_id", self.inner.local.node_id())
            .field("circles", &self.inner.circles.len())
            .finish()
    }
}

impl MeshNode {
    /// Start building a node for `local` dialing over `transport`.
    pub fn builder(local: LocalNode, transport: Arc<dyn Transport>) -> MeshNodeBuilder {
        MeshNodeBuilder {
            local,
            transport,
            settings: NodeSettings::default(),
            discovery: None,
            realtime: None,
            store: None,
        }
    }

    /// Validate `config`, build a node and join every configured circle.
    pub fn from_config(config: &NodeConfig, transport: Arc<dyn Transport>) -> Result<Self, MeshError> {
        config.validate()?;
        let node_id = config
            .node
            .node_id
            .clone()
            .map(NodeId::new)
            .unwrap_or_else(NodeId::random);
        let capabilities = Capabilities {
            can_anchor: config.node.can_anchor,
            is_mobile: config.node.is_mobile,
            public_reachable: false,
        };
        let local = LocalNode::new(node_id, config.node.display_name.clone(), capabilities);
        let node = Self::builder(local, transport)
            .settings(NodeSettings::from_config(config))
            .build();
        for secret in config.circle_secrets()? {
            node.join_circle(secret)?;
        }
        Ok(node)
    }

    /// The local node.
    pub fn local(&self) -> &Arc<LocalNode> {
        &self.inner.local
    }

    /// Subscribe to presentation events from every circle.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Join a circle. Joining twice returns the existing circle.
    pub fn join_circle(&self, secret: CircleSecret) -> Result<Arc<Circle>, MeshError> {
        let circle_id = secret.circle_id();
        if let Some(existing) = self.inner.circles.get(&circle_id) {
            return Ok(existing.clone());
        }
        let circle = Arc::new(Circle::new(
            secret,
            self.inner.local.clone(),
            self.inner.settings.circle.clone(),
            self.inner.events.clone(),
        )?);
        self.inner.circles.insert(circle_id.clone(), circle.clone());
        info!(circle = %circle_id, hint = %circle.hint(), "joined circle");

        if self.inner.started.load(Ordering::SeqCst) {
            self.spawn_circle(circle.clone());
        }
        Ok(circle)
    }

    /// A joined circle.
    pub fn circle(&self, circle_id: &CircleId) -> Option<Arc<Circle>> {
        self.inner.circles.get(circle_id).map(|c| c.clone())
    }

    /// All joined circles.
    pub fn circles(&self) -> Vec<Arc<Circle>> {
        self.inner.circles.iter().map(|c| c.value().clone()).collect()
    }

    fn secret_for(&self, circle_id: &CircleId) -> Option<CircleSecret> {
        self.inner
            .circles
            .get(circle_id)
            .map(|c| c.secret().clone())
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn snapshot_path(dir: &Path, circle: &Circle) -> PathBuf {
        dir.join(format!("{}.json", circle.hint()))
    }

    /// Write a snapshot of every circle into `dir`.
    pub async fn save_state(&self, dir: &Path) -> Result<usize, MeshError> {
        tokio::fs::create_dir_all(dir).await?;
        let mut saved = 0;
        for circle in self.circles() {
            let json = circle.snapshot().await.to_json()?;
            let path = Self::snapshot_path(dir, &circle);
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, &path).await?;
            saved += 1;
        }
        info!(dir = %dir.display(), circles = saved, "state saved");
        Ok(saved)
    }

    /// Restore circles from snapshots in `dir`. Missing files are skipped.
    pub async fn load_state(&self, dir: &Path) -> Result<usize, MeshError> {
        let mut restored = 0;
        for circle in self.circles() {
            let path = Self::snapshot_path(dir, &circle);
            let json = match tokio::fs::read_to_string(&path).await {
                Ok(json) => json,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let snapshot = CircleSnapshot::from_json(&json, circle.circle_id())?;
            let report = circle.restore(snapshot).await?;
            if report.rejected > 0 {
                warn!(circle = %circle.circle_id(), rejected = report.rejected, "snapshot had unverifiable messages");
            }
            restored += 1;
        }
        Ok(restored)
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Accept inbound sessions on `listener` until it fails.
    pub async fn serve(&self, listener: Arc<dyn Listener>) {
        self.inner.local.add_endpoint(listener.local_endpoint()).await;
        let node = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            let address = conn.peer_address();
                            if let Err(e) = node.handle_connection(conn).await {
                                debug!(peer = %address, kind = ?e.kind(), error = %e, "inbound session ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "listener stopped");
                        break;
                    }
                }
            }
        });
        self.track(handle);
    }

    /// Authenticate one inbound connection and answer the round it opens.
    pub async fn handle_connection(&self, conn: Box<dyn Connection>) -> Result<(), MeshError> {
        let settings = &self.inner.settings;
        let mut session = SecureSession::accept(
            conn,
            |circle_id| self.secret_for(circle_id),
            self.inner.local.node_id(),
            settings.routing.frame_timeout,
        )
        .await?;

        if self.inner.local.mark_public_reachable().await {
            info!("accepted an inbound session, now publicly reachable");
        }
        let circle = self
            .circle(session.circle_id())
            .ok_or_else(|| MeshError::UnknownCircle(session.circle_id().clone()))?;
        circle.record_contact(session.peer(), true, now_ms()).await;

        let sync_config = settings.routing.sync;
        let first = session.recv().await?;
        let result = match first {
            Frame::Peers { .. } => sync::respond(&mut session, &circle, first, &sync_config)
                .await
                .map(|report| {
                    debug!(circle = %circle.circle_id(), received = report.merged.received, "answered round");
                }),
            Frame::AnchorPush { .. } | Frame::AnchorPull { .. } => {
                anchor::serve(&mut session, &circle, first, &sync_config)
                    .await
                    .map(|report| {
                        debug!(circle = %circle.circle_id(), accepted = report.accepted, "served anchor session");
                    })
            }
            Frame::Bye { .. } => Ok(()),
            other => Err(sync::unexpected("PEERS or ANCHOR_PUSH", &other)),
        };
        session.close().await;
        result
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Next peer to sync with, rotating through peers that have an endpoint.
    pub async fn pick_target(&self, circle: &Circle) -> Option<NodeId> {
        let mut peers: Vec<PeerRecord> = circle
            .peers()
            .await
            .into_iter()
            .filter(|p| p.best_endpoint().is_some())
            .collect();
        if peers.is_empty() {
            return None;
        }
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let index = self.inner.next_target.fetch_add(1, Ordering::Relaxed) % peers.len();
        Some(peers.swap_remove(index).node_id)
    }

    /// One routed sync attempt for a circle.
    pub async fn sync_once(
        &self,
        circle_id: &CircleId,
        target: Option<&NodeId>,
    ) -> Result<RoutingOutcome, MeshError> {
        let circle = self
            .circle(circle_id)
            .ok_or_else(|| MeshError::UnknownCircle(circle_id.clone()))?;
        self.inner.routing.sync_with(&circle, target).await
    }

    // =========================================================================
    // Periodic tasks
    // =========================================================================

    /// Start drivers and tickers for every joined circle.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for circle in self.circles() {
            self.spawn_circle(circle);
        }
        info!(node = %self.inner.local.node_id(), circles = self.inner.circles.len(), "node started");
    }

    fn spawn_circle(&self, circle: Arc<Circle>) {
        let (tx, rx) = mpsc::channel(DRIVER_QUEUE);
        self.inner.drivers.insert(circle.circle_id().clone(), tx.clone());
        let settings = &self.inner.settings;

        self.track(tokio::spawn(drive(self.clone(), circle.clone(), rx)));
        self.track(ticker(tx.clone(), settings.sync_interval, || CircleCommand::SyncTick));
        self.track(ticker(tx.clone(), settings.announce_interval, || {
            CircleCommand::AnnounceTick
        }));
        self.track(ticker(tx.clone(), settings.maintain_interval, || {
            CircleCommand::MaintainTick
        }));
        if let Some(discovery) = &self.inner.discovery {
            self.track(tokio::spawn(refresh_discovery(
                discovery.clone(),
                circle.clone(),
                settings.clone(),
                tx.clone(),
            )));
        }
        if let Some(mut notifications) = self
            .inner
            .routing
            .realtime_relay()
            .and_then(|relay| relay.subscribe())
        {
            let hint = circle.hint().clone();
            self.track(tokio::spawn(async move {
                loop {
                    match notifications.recv().await {
                        Ok(notified) if notified == hint => {
                            if tx.send(CircleCommand::RelayNotified).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
    }

    /// Queue a command for a circle's driver.
    pub async fn command(&self, circle_id: &CircleId, command: CircleCommand) -> bool {
        let sender = self.inner.drivers.get(circle_id).map(|tx| tx.clone());
        match sender {
            Some(tx) => tx.send(command).await.is_ok(),
            None => false,
        }
    }

    /// Stop every task and withdraw discovery registrations.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        self.inner.drivers.clear();
        self.inner.started.store(false, Ordering::SeqCst);

        if let Some(discovery) = &self.inner.discovery {
            for circle in self.circles() {
                let stamp = RequestStamp::fresh(now_ms());
                if let Err(e) = discovery
                    .unregister(self.inner.local.node_id(), circle.hint(), stamp)
                    .await
                {
                    debug!(circle = %circle.circle_id(), error = %e, "unregister failed");
                }
            }
        }
        info!(node = %self.inner.local.node_id(), "node stopped");
    }
}

fn ticker(
    tx: mpsc::Sender<CircleCommand>,
    period: Duration,
    command: fn() -> CircleCommand,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            match tx.try_send(command()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(skipped)) => {
                    debug!(command = ?skipped, "driver busy, tick skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}

async fn drive(node: MeshNode, circle: Arc<Circle>, mut commands: mpsc::Receiver<CircleCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            CircleCommand::SyncTick => {
                circle.elect(now_ms()).await;
                let target = node.pick_target(&circle).await;
                match node.inner.routing.sync_with(&circle, target.as_ref()).await {
                    Ok(outcome) => debug!(
                        circle = %circle.circle_id(),
                        tier = %outcome.tier,
                        failed_tiers = outcome.failures.len(),
                        "sync tick done"
                    ),
                    Err(e) => debug!(circle = %circle.circle_id(), error = %e, "sync tick failed"),
                }
            }
            CircleCommand::AnnounceTick => {
                if let Err(e) = circle.announce_anchor().await {
                    warn!(circle = %circle.circle_id(), error = %e, "anchor announce failed");
                }
            }
            CircleCommand::MaintainTick => {
                circle.maintain(now_ms()).await;
            }
            CircleCommand::Discovered(records) => {
                let added = circle.merge_peers(records).await;
                if added > 0 {
                    debug!(circle = %circle.circle_id(), added, "discovery added peers");
                }
            }
            CircleCommand::RelayNotified => {
                if let Some(relay) = node.inner.routing.realtime_relay() {
                    if let Err(e) =
                        relay_exchange(relay.as_ref(), &circle, &MarkKey::RealtimeRelay).await
                    {
                        debug!(circle = %circle.circle_id(), error = %e, "realtime pull failed");
                    }
                }
            }
        }
    }
}

/// Register and look up peers every refresh period, retrying with backoff.
async fn refresh_discovery(
    discovery: Arc<dyn DiscoverySource>,
    circle: Arc<Circle>,
    settings: NodeSettings,
    tx: mpsc::Sender<CircleCommand>,
) {
    let ttl_ms = settings.discovery_ttl.as_millis() as u64;
    let mut timer = tokio::time::interval(settings.discovery_refresh);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let mut backoff = Backoff::new(
            settings.routing.backoff_base,
            settings.routing.backoff_cap,
        );
        for attempt in 1..=settings.discovery_attempts.max(1) {
            let record = circle.local().peer_record(now_ms()).await;
            let registration =
                Registration::from_record(&record, circle.hint().clone(), ttl_ms, now_ms());
            let result = match discovery.register(registration).await {
                Ok(()) => discovery.lookup(circle.hint(), settings.lookup_limit).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(records) => {
                    if tx.send(CircleCommand::Discovered(records)).await.is_err() {
                        return;
                    }
                    break;
                }
                Err(e) => {
                    debug!(circle = %circle.circle_id(), attempt, error = %e, "discovery refresh failed");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::ChannelId;

    use crate::discovery::MemoryDiscovery;
    use crate::transport::MemoryNetwork;

    fn node(network: &MemoryNetwork, name: &str) -> MeshNode {
        let local = LocalNode::new(NodeId::new(name), name, Capabilities::default());
        MeshNode::builder(local, Arc::new(network.clone())).build()
    }

    fn secret() -> CircleSecret {
        CircleSecret::from_bytes([4u8; 32])
    }

    async fn listen(network: &MemoryNetwork, node: &MeshNode, name: &str) {
        node.serve(Arc::new(network.bind(name).unwrap())).await;
    }

    // ===========================================
    // Circles
    // ===========================================

    #[test]
    fn joining_twice_returns_same_circle() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        let first = alice.join_circle(secret()).unwrap();
        let second = alice.join_circle(secret()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(alice.circles().len(), 1);
    }

    #[tokio::test]
    async fn sync_once_reaches_listening_peer() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        let bob = node(&network, "bob");
        let alice_circle = alice.join_circle(secret()).unwrap();
        let bob_circle = bob.join_circle(secret()).unwrap();
        listen(&network, &bob, "bob").await;

        alice_circle
            .merge_peers(vec![bob.local().peer_record(now_ms()).await])
            .await;
        let msg = alice_circle.post(&ChannelId::general(), "hello").await.unwrap();

        let mut events = bob.subscribe();
        let outcome = alice
            .sync_once(alice_circle.circle_id(), Some(&NodeId::new("bob")))
            .await
            .unwrap();
        assert_eq!(outcome.tier, crate::routing::Tier::Direct);

        // Bob merges the pushed record after Alice has already said BYE.
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let MeshEvent::MessageReceived { message, .. } = events.recv().await.unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received.msg_id, msg.msg_id);
        assert!(bob_circle.contains(&msg.msg_id).await);
        assert!(bob.local().capabilities().await.public_reachable);
    }

    #[tokio::test]
    async fn unknown_circle_is_refused() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        let bob = node(&network, "bob");
        let alice_circle = alice.join_circle(secret()).unwrap();
        bob.join_circle(CircleSecret::from_bytes([5u8; 32])).unwrap();
        listen(&network, &bob, "bob").await;
        alice_circle
            .merge_peers(vec![bob.local().peer_record(now_ms()).await])
            .await;

        let result = alice
            .sync_once(alice_circle.circle_id(), Some(&NodeId::new("bob")))
            .await;
        assert!(matches!(result, Err(MeshError::AllTiersFailed(_))));
        assert!(!bob.local().capabilities().await.public_reachable);
    }

    #[tokio::test]
    async fn sync_once_for_unknown_circle_errors() {
        let alice = node(&MemoryNetwork::new(), "alice");
        let result = alice.sync_once(&CircleId::new("nope"), None).await;
        assert!(matches!(result, Err(MeshError::UnknownCircle(_))));
    }

    // ===========================================
    // Persistence
    // ===========================================

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        let circle = alice.join_circle(secret()).unwrap();
        let msg = circle.post(&ChannelId::general(), "remember me").await.unwrap();
        assert_eq!(alice.save_state(dir.path()).await.unwrap(), 1);

        let restarted = node(&network, "alice");
        let fresh = restarted.join_circle(secret()).unwrap();
        restarted.join_circle(CircleSecret::from_bytes([9u8; 32])).unwrap();
        assert_eq!(restarted.load_state(dir.path()).await.unwrap(), 1);
        let back = fresh.message(&msg.msg_id).await.unwrap();
        assert_eq!(back.text.as_deref(), Some("remember me"));
    }

    // ===========================================
    // Periodic tasks
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn discovery_refresh_feeds_directory() {
        let network = MemoryNetwork::new();
        let discovery = Arc::new(MemoryDiscovery::new());

        let make = |name: &str| {
            let local = LocalNode::new(NodeId::new(name), name, Capabilities::default());
            MeshNode::builder(local, Arc::new(network.clone()))
                .discovery(discovery.clone())
                .build()
        };
        let alice = make("alice");
        let bob = make("bob");
        let alice_circle = alice.join_circle(secret()).unwrap();
        bob.join_circle(secret()).unwrap();
        listen(&network, &alice, "alice").await;
        listen(&network, &bob, "bob").await;

        bob.start();
        alice.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        alice.command(alice_circle.circle_id(), CircleCommand::MaintainTick).await;
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(alice_circle.peer(&NodeId::new("bob")).await.is_some());
        alice.shutdown().await;
        bob.shutdown().await;
    }
}
