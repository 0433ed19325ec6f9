//! One gossip round over an authenticated session.
//!
//! ```text
//! Initiator                          Responder
//!   PEERS*                         →
//!                                  ← PEERS*
//!   MSGS_HAVE*                     →
//!                                  ← MSGS_HAVE*
//!   MSGS_REQ*                      →
//!                                  ← MSGS_SEND*
//!                                  ← MSGS_REQ*
//!   MSGS_SEND*                     →
//!   BYE                            →
//! ```
//!
//! `*` marks chunked phases; every chunk but the last has `more = true`.
//! The side that reads first in each phase is fixed, so neither peer blocks
//! writing while the other is writing too. Each phase has its own deadline.

use std::future::Future;
use std::time::Duration;

use mesh_types::{chunk_frames, now_ms, ChatMessage, Frame, MsgId, PeerRecord, MAX_PLAIN_FRAME};
use tracing::{debug, warn};

use crate::circle::{Circle, MergeReport, MAX_GOSSIP_PEERS};
use crate::session::SecureSession;
use crate::MeshError;

/// Default per-phase deadline (30 s).
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Round tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Deadline for each phase
    pub phase_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }
}

/// What a round exchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// New peers learned
    pub peers_merged: usize,
    /// Merge counters for records received
    pub merged: MergeReport,
    /// Records sent
    pub sent: usize,
}

pub(crate) async fn phase<T, F>(name: &'static str, limit: Duration, fut: F) -> Result<T, MeshError>
where
    F: Future<Output = Result<T, MeshError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MeshError::Timeout(name)),
    }
}

pub(crate) fn unexpected(expected: &str, got: &Frame) -> MeshError {
    MeshError::Protocol(format!("expected {expected}, got {}", got.name()))
}

/// Records small enough to travel in one frame.
///
/// Locally authored records always pass; this only catches oversized
/// records merged from older peers.
pub(crate) fn fits_frame(message: &ChatMessage) -> bool {
    match message.check_record_size() {
        Ok(()) => true,
        Err(e) => {
            warn!(msg = %message.msg_id, error = %e, "not forwarding record");
            false
        }
    }
}

async fn send_all(session: &mut SecureSession, frames: Vec<Frame>) -> Result<(), MeshError> {
    for frame in &frames {
        session.send(frame).await?;
    }
    Ok(())
}

/// Receive a chunked phase, using `pick` to unpack each chunk.
async fn recv_chunks<T>(
    session: &mut SecureSession,
    expected: &str,
    pick: impl Fn(Frame) -> Result<(Vec<T>, bool), Frame>,
) -> Result<Vec<T>, MeshError> {
    let mut items = Vec::new();
    loop {
        match pick(session.recv().await?) {
            Ok((chunk, more)) => {
                items.extend(chunk);
                if !more {
                    return Ok(items);
                }
            }
            Err(other) => return Err(unexpected(expected, &other)),
        }
    }
}

/// Collect a peer exchange that opened with `first`.
async fn recv_peers(
    session: &mut SecureSession,
    first: Frame,
) -> Result<Vec<PeerRecord>, MeshError> {
    let mut peers = Vec::new();
    let mut next = first;
    loop {
        let (chunk, more) = match next {
            Frame::Peers { peers, more } => (peers, more),
            other => return Err(unexpected("PEERS", &other)),
        };
        peers.extend(chunk);
        if peers.len() > MAX_GOSSIP_PEERS {
            return Err(MeshError::Protocol(format!(
                "peer exchange exceeds {MAX_GOSSIP_PEERS} records"
            )));
        }
        if !more {
            return Ok(peers);
        }
        next = session.recv().await?;
    }
}

async fn send_peers(session: &mut SecureSession, circle: &Circle) -> Result<(), MeshError> {
    let ours = circle.peer_exchange(now_ms()).await;
    let frames = chunk_frames(&ours, MAX_PLAIN_FRAME, |peers, more| Frame::Peers { peers, more })?;
    send_all(session, frames).await
}

fn pick_have(frame: Frame) -> Result<(Vec<MsgId>, bool), Frame> {
    match frame {
        Frame::MsgsHave { ids, more } => Ok((ids, more)),
        other => Err(other),
    }
}

fn pick_req(frame: Frame) -> Result<(Vec<MsgId>, bool), Frame> {
    match frame {
        Frame::MsgsReq { ids, more } => Ok((ids, more)),
        other => Err(other),
    }
}

fn pick_send(frame: Frame) -> Result<(Vec<ChatMessage>, bool), Frame> {
    match frame {
        Frame::MsgsSend { messages, more } => Ok((messages, more)),
        other => Err(other),
    }
}

async fn send_have(session: &mut SecureSession, circle: &Circle) -> Result<(), MeshError> {
    let digest = circle.digest().await;
    let frames = chunk_frames(&digest, MAX_PLAIN_FRAME, |ids, more| Frame::MsgsHave { ids, more })?;
    send_all(session, frames).await
}

async fn send_req(session: &mut SecureSession, wanted: &[MsgId]) -> Result<(), MeshError> {
    let frames = chunk_frames(wanted, MAX_PLAIN_FRAME, |ids, more| Frame::MsgsReq { ids, more })?;
    send_all(session, frames).await
}

async fn answer_req(
    session: &mut SecureSession,
    circle: &Circle,
    requested: &[MsgId],
) -> Result<usize, MeshError> {
    let outbound: Vec<ChatMessage> = circle
        .outbound(requested)
        .await
        .into_iter()
        .filter(fits_frame)
        .collect();
    let frames = chunk_frames(&outbound, MAX_PLAIN_FRAME, |messages, more| Frame::MsgsSend {
        messages,
        more,
    })?;
    send_all(session, frames).await?;
    Ok(outbound.len())
}

/// Run a round as initiator. The session must be authenticated.
pub async fn run_round(
    session: &mut SecureSession,
    circle: &Circle,
    config: &SyncConfig,
) -> Result<RoundReport, MeshError> {
    let limit = config.phase_timeout;
    let mut report = RoundReport::default();
    session.begin_sync();

    report.peers_merged = phase("peer exchange", limit, async {
        send_peers(session, circle).await?;
        let first = session.recv().await?;
        let peers = recv_peers(session, first).await?;
        Ok::<_, MeshError>(circle.merge_peers(peers).await)
    })
    .await?;

    let remote = phase("digest", limit, async {
        send_have(session, circle).await?;
        recv_chunks(session, "MSGS_HAVE", pick_have).await
    })
    .await?;

    let wanted = circle.missing_from(&remote).await;
    report.merged = phase("pull", limit, async {
        send_req(session, &wanted).await?;
        let received = recv_chunks(session, "MSGS_SEND", pick_send).await?;
        Ok::<_, MeshError>(circle.merge_incoming(received).await)
    })
    .await?;

    report.sent = phase("push", limit, async {
        let requested = recv_chunks(session, "MSGS_REQ", pick_req).await?;
        answer_req(session, circle, &requested).await
    })
    .await?;

    session.send(&Frame::Bye { reason: None }).await?;
    debug!(
        circle = %circle.circle_id(),
        peer = %session.peer(),
        received = report.merged.received,
        sent = report.sent,
        "round complete"
    );
    Ok(report)
}

/// Answer a round as responder. `first` is the frame that opened it.
pub async fn respond(
    session: &mut SecureSession,
    circle: &Circle,
    first: Frame,
    config: &SyncConfig,
) -> Result<RoundReport, MeshError> {
    let limit = config.phase_timeout;
    let mut report = RoundReport::default();
    session.begin_sync();

    report.peers_merged = phase("peer exchange", limit, async {
        let peers = recv_peers(session, first).await?;
        let merged = circle.merge_peers(peers).await;
        send_peers(session, circle).await?;
        Ok::<_, MeshError>(merged)
    })
    .await?;

    let remote = phase("digest", limit, async {
        let remote = recv_chunks(session, "MSGS_HAVE", pick_have).await?;
        send_have(session, circle).await?;
        Ok::<_, MeshError>(remote)
    })
    .await?;

    report.sent = phase("push", limit, async {
        let requested = recv_chunks(session, "MSGS_REQ", pick_req).await?;
        answer_req(session, circle, &requested).await
    })
    .await?;

    let wanted = circle.missing_from(&remote).await;
    report.merged = phase("pull", limit, async {
        send_req(session, &wanted).await?;
        let received = recv_chunks(session, "MSGS_SEND", pick_send).await?;
        Ok::<_, MeshError>(circle.merge_incoming(received).await)
    })
    .await?;

    // The initiator may close without a BYE; the round is complete either way.
    match phase("bye", limit, session.recv()).await {
        Ok(Frame::Bye { .. }) | Err(_) => {}
        Ok(other) => return Err(unexpected("BYE", &other)),
    }
    debug!(
        circle = %circle.circle_id(),
        peer = %session.peer(),
        received = report.merged.received,
        sent = report.sent,
        "round answered"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mesh_types::{Capabilities, ChannelId, Endpoint, NodeId};
    use tokio::sync::broadcast;

    use crate::circle::CircleSettings;
    use crate::crypto::CircleSecret;
    use crate::local::LocalNode;
    use crate::transport::{Listener, MemoryNetwork, Transport};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn circle(name: &str) -> Arc<Circle> {
        let (tx, _) = broadcast::channel(64);
        let local = Arc::new(LocalNode::new(NodeId::new(name), name, Capabilities::default()));
        Arc::new(
            Circle::new(CircleSecret::from_bytes([5u8; 32]), local, CircleSettings::default(), tx)
                .unwrap(),
        )
    }

    async fn sessions() -> (SecureSession, SecureSession) {
        let network = MemoryNetwork::new();
        let listener = network.bind("bob").unwrap();
        let client = network.connect(&Endpoint::memory("bob", 0)).await.unwrap();
        let server = listener.accept().await.unwrap();
        let secret = CircleSecret::from_bytes([5u8; 32]);
        let responder_secret = secret.clone();
        let accept = tokio::spawn(async move {
            SecureSession::accept(
                server,
                move |_| Some(responder_secret.clone()),
                &NodeId::new("bob"),
                TIMEOUT,
            )
            .await
            .unwrap()
        });
        let initiator = SecureSession::initiate(client, &secret, &NodeId::new("alice"), TIMEOUT)
            .await
            .unwrap();
        (initiator, accept.await.unwrap())
    }

    // ===========================================
    // Full rounds
    // ===========================================

    #[tokio::test]
    async fn round_converges_both_ways() {
        let alice = circle("alice");
        let bob = circle("bob");
        alice.post(&ChannelId::general(), "from alice").await.unwrap();
        bob.post(&ChannelId::general(), "from bob").await.unwrap();
        bob.post(&ChannelId::general(), "also bob").await.unwrap();

        let (mut initiator, mut responder) = sessions().await;
        let config = SyncConfig::default();

        let bob_side = bob.clone();
        let serve = tokio::spawn(async move {
            let first = responder.recv().await.unwrap();
            respond(&mut responder, &bob_side, first, &config).await.unwrap()
        });
        let report = run_round(&mut initiator, &alice, &config).await.unwrap();
        let answered = serve.await.unwrap();

        assert_eq!(report.merged.received, 2);
        assert_eq!(report.sent, 1);
        assert_eq!(answered.merged.received, 1);
        assert_eq!(report.peers_merged, 1);
        assert_eq!(alice.digest().await.len(), 3);
        assert_eq!(bob.digest().await.len(), 3);
    }

    #[tokio::test]
    async fn second_round_transfers_nothing() {
        let alice = circle("alice");
        let bob = circle("bob");
        alice.post(&ChannelId::general(), "x").await.unwrap();
        let config = SyncConfig::default();

        for expected in [1usize, 0] {
            let (mut initiator, mut responder) = sessions().await;
            let bob_side = bob.clone();
            let serve = tokio::spawn(async move {
                let first = responder.recv().await.unwrap();
                respond(&mut responder, &bob_side, first, &config).await.unwrap()
            });
            let report = run_round(&mut initiator, &alice, &config).await.unwrap();
            serve.await.unwrap();
            assert_eq!(report.sent, expected);
        }
    }

    #[tokio::test]
    async fn full_ipv6_peer_exchange_still_syncs() {
        let alice = circle("alice");
        let bob = circle("bob");
        let now = now_ms();
        let records: Vec<PeerRecord> = (0..40u16)
            .map(|i| {
                let id = NodeId::new(format!("peer-{i:02}"));
                let mut rec = PeerRecord::new(id, now, Capabilities::default());
                for port in 0..4u16 {
                    rec.observe_endpoint(Endpoint::tcp(
                        format!("2001:db8:85a3:1234:5678:8a2e:{i:04x}:{port:04x}"),
                        7000 + port,
                        now,
                    ));
                }
                rec
            })
            .collect();
        alice.merge_peers(records).await;
        let msg = alice.post(&ChannelId::general(), "over a crowded mesh").await.unwrap();

        let ours = alice.peer_exchange(now_ms()).await;
        assert_eq!(ours.len(), MAX_GOSSIP_PEERS);
        let one_frame = Frame::Peers {
            peers: ours,
            more: false,
        };
        assert!(one_frame.to_bytes().unwrap().len() > MAX_PLAIN_FRAME);

        let (mut initiator, mut responder) = sessions().await;
        let config = SyncConfig::default();
        let bob_side = bob.clone();
        let serve = tokio::spawn(async move {
            let first = responder.recv().await.unwrap();
            respond(&mut responder, &bob_side, first, &config).await.unwrap()
        });
        let report = run_round(&mut initiator, &alice, &config).await.unwrap();
        let answered = serve.await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(answered.peers_merged, MAX_GOSSIP_PEERS);
        assert!(bob.contains(&msg.msg_id).await);
    }

    #[tokio::test]
    async fn oversized_peer_exchange_refused() {
        let bob = circle("bob");
        let (_initiator, mut responder) = sessions().await;
        let flood: Vec<PeerRecord> = (0..=MAX_GOSSIP_PEERS)
            .map(|i| PeerRecord::new(NodeId::new(format!("p{i}")), 1, Capabilities::default()))
            .collect();
        let result = respond(
            &mut responder,
            &bob,
            Frame::Peers {
                peers: flood,
                more: false,
            },
            &SyncConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(MeshError::Protocol(_))));
        assert!(bob.peers().await.is_empty());
    }

    #[tokio::test]
    async fn responder_requires_peers_first() {
        let bob = circle("bob");
        let (_initiator, mut responder) = sessions().await;
        let result = respond(
            &mut responder,
            &bob,
            Frame::MsgsHave {
                ids: Vec::new(),
                more: false,
            },
            &SyncConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(MeshError::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_responder_hits_phase_deadline() {
        let alice = circle("alice");
        let (mut initiator, _responder) = sessions().await;
        let config = SyncConfig {
            phase_timeout: Duration::from_millis(500),
        };
        let result = run_round(&mut initiator, &alice, &config).await;
        assert!(matches!(result, Err(MeshError::Timeout("peer exchange"))));
    }
}
