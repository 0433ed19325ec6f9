//! Anchor push/pull over an authenticated session.
//!
//! A member pushes the envelopes it authored or learned since its last push,
//! then pages through everything the anchor stored after its pull cursor:
//!
//! ```text
//! Member                            Anchor
//!   ANCHOR_PUSH*                  →
//!                                 ← ANCHOR_PUSH_ACK{accepted,cursor,epoch}
//!   ANCHOR_PULL{since,limit}      →
//!                                 ← ANCHOR_MSGS{messages,next_cursor,more,epoch}
//!   ...repeat while more...
//!   BYE                           →
//! ```
//!
//! Cursors are only meaningful within one anchor store epoch. A member that
//! sees a new epoch starts both watermarks over.

use mesh_types::{chunk_frames, now_ms, ChatMessage, Cursor, Frame, MAX_PLAIN_FRAME};
use tracing::{debug, info, warn};

use crate::circle::{Circle, MarkKey, MergeReport};
use crate::session::SecureSession;
use crate::sync::{fits_frame, phase, unexpected, SyncConfig};
use crate::MeshError;

/// Entries requested per pull page.
pub const PULL_LIMIT: u32 = 100;

/// Pages pulled in one exchange before yielding to the next round.
pub const MAX_PULL_PAGES: usize = 64;

/// Envelopes pushed in one exchange. An anchor ends sessions that push more.
pub const MAX_PUSH_RECORDS: usize = 2_000;

/// What one anchor exchange moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorReport {
    /// Envelopes pushed
    pub pushed: usize,
    /// Envelopes the anchor newly stored
    pub accepted: u32,
    /// Merge counters for pulled envelopes
    pub pulled: MergeReport,
}

/// Push to and pull from the anchor at the other end of `session`.
pub async fn exchange(
    session: &mut SecureSession,
    circle: &Circle,
    config: &SyncConfig,
) -> Result<AnchorReport, MeshError> {
    let limit = config.phase_timeout;
    let key = MarkKey::Anchor(session.peer().clone());
    let mut report = AnchorReport::default();
    session.begin_sync();

    let (pending, seq) = circle.pending_push(&key, now_ms(), MAX_PUSH_RECORDS).await;
    let pending: Vec<ChatMessage> = pending.into_iter().filter(fits_frame).collect();
    report.pushed = pending.len();

    let (accepted, epoch) = phase("anchor push", limit, async {
        let frames = chunk_frames(&pending, MAX_PLAIN_FRAME, |messages, more| {
            Frame::AnchorPush { messages, more }
        })?;
        for frame in &frames {
            session.send(frame).await?;
        }
        match session.recv().await? {
            Frame::AnchorPushAck { accepted, epoch, .. } => Ok((accepted, epoch)),
            Frame::Bye { .. } => Err(MeshError::Protocol("peer declined to anchor".into())),
            other => Err(unexpected("ANCHOR_PUSH_ACK", &other)),
        }
    })
    .await?;
    report.accepted = accepted;

    if circle.observe_epoch(&key, epoch).await {
        // Everything pushed before the restart is gone; push it all again next time.
        info!(anchor = %session.peer(), "anchor store restarted, resetting watermarks");
    } else {
        circle.commit_push(&key, seq).await;
    }

    for _ in 0..MAX_PULL_PAGES {
        let since = circle.pull_cursor(&key).await;
        let (messages, next_cursor, more, page_epoch) = phase("anchor pull", limit, async {
            session
                .send(&Frame::AnchorPull {
                    since,
                    limit: PULL_LIMIT,
                })
                .await?;
            match session.recv().await? {
                Frame::AnchorMsgs {
                    messages,
                    next_cursor,
                    more,
                    epoch,
                } => Ok((messages, next_cursor, more, epoch)),
                other => Err(unexpected("ANCHOR_MSGS", &other)),
            }
        })
        .await?;

        report.pulled.absorb(circle.merge_incoming(messages).await);
        if page_epoch != epoch {
            circle.observe_epoch(&key, page_epoch).await;
            info!(anchor = %session.peer(), "anchor store restarted mid-exchange");
            break;
        }
        circle.commit_pull(&key, next_cursor).await;
        if !more {
            break;
        }
    }

    session.send(&Frame::Bye { reason: None }).await?;
    debug!(
        anchor = %session.peer(),
        pushed = report.pushed,
        accepted = report.accepted,
        pulled = report.pulled.received,
        "anchor exchange complete"
    );
    Ok(report)
}

/// Page from the local anchor store, halving the page until its frame fits.
async fn fitting_page(circle: &Circle, since: Cursor, requested: u32) -> Result<Frame, MeshError> {
    let mut limit = match requested {
        0 => PULL_LIMIT,
        n => n.min(PULL_LIMIT),
    } as usize;
    let epoch = circle.anchor_epoch();
    loop {
        let page = circle.anchor_pull(since, limit).await;
        let frame = Frame::AnchorMsgs {
            messages: page.messages,
            next_cursor: page.next_cursor,
            more: page.more,
            epoch,
        };
        if frame.to_bytes()?.len() <= MAX_PLAIN_FRAME {
            return Ok(frame);
        }
        if limit == 1 {
            // A single entry that can never fit: step over it.
            warn!(cursor = %page.next_cursor, "skipping oversized anchor entry");
            return Ok(Frame::AnchorMsgs {
                messages: Vec::new(),
                next_cursor: page.next_cursor,
                more: page.more,
                epoch,
            });
        }
        limit /= 2;
    }
}

/// Serve an anchor session opened by `first`.
///
/// A node that has not opted in to anchoring answers with BYE.
pub async fn serve(
    session: &mut SecureSession,
    circle: &Circle,
    first: Frame,
    config: &SyncConfig,
) -> Result<AnchorReport, MeshError> {
    let mut report = AnchorReport::default();
    if !circle.local().capabilities().await.can_anchor {
        session.send(&Frame::bye("not an anchor")).await?;
        return Ok(report);
    }
    session.begin_sync();

    // Chunks are stored as they arrive; only the count carries across them.
    let mut pushed = 0usize;
    let mut accepted = 0u32;
    let mut next = Some(first);
    loop {
        let frame = match next.take() {
            Some(frame) => frame,
            None => match phase("anchor serve", config.phase_timeout, session.recv()).await {
                Ok(frame) => frame,
                // Members may close without BYE once they have what they need.
                Err(MeshError::Transport(_)) => break,
                Err(e) => return Err(e),
            },
        };
        match frame {
            Frame::AnchorPush { messages, more } => {
                pushed += messages.len();
                if pushed > MAX_PUSH_RECORDS {
                    warn!(member = %session.peer(), pushed, "push over limit, ending session");
                    session.send(&Frame::bye("push too large")).await?;
                    return Err(MeshError::Protocol(format!(
                        "push exceeds {MAX_PUSH_RECORDS} envelopes"
                    )));
                }
                let (stored, cursor, merged) = circle.anchor_accept(messages).await;
                accepted += stored;
                report.pulled.absorb(merged);
                if !more {
                    report.pushed += pushed;
                    report.accepted += accepted;
                    session
                        .send(&Frame::AnchorPushAck {
                            accepted,
                            cursor,
                            epoch: circle.anchor_epoch(),
                        })
                        .await?;
                    pushed = 0;
                    accepted = 0;
                }
            }
            Frame::AnchorPull { since, limit } => {
                let page = fitting_page(circle, since, limit).await?;
                session.send(&page).await?;
            }
            Frame::Bye { .. } => break,
            other => return Err(unexpected("ANCHOR_PUSH or ANCHOR_PULL", &other)),
        }
    }
    debug!(
        member = %session.peer(),
        accepted = report.accepted,
        "anchor session served"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use mesh_types::{Capabilities, ChannelId, Endpoint, NodeId};
    use tokio::sync::broadcast;

    use crate::circle::CircleSettings;
    use crate::crypto::CircleSecret;
    use crate::local::LocalNode;
    use crate::transport::{Listener, MemoryNetwork, Transport};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn secret() -> CircleSecret {
        CircleSecret::from_bytes([6u8; 32])
    }

    fn circle(name: &str, can_anchor: bool) -> Arc<Circle> {
        let (tx, _) = broadcast::channel(64);
        let caps = Capabilities {
            can_anchor,
            ..Capabilities::default()
        };
        let local = Arc::new(LocalNode::new(NodeId::new(name), name, caps));
        Arc::new(Circle::new(secret(), local, CircleSettings::default(), tx).unwrap())
    }

    async fn sessions(member: &str, anchor: &str) -> (SecureSession, SecureSession) {
        let network = MemoryNetwork::new();
        let listener = network.bind(anchor).unwrap();
        let client = network.connect(&Endpoint::memory(anchor, 0)).await.unwrap();
        let server = listener.accept().await.unwrap();
        let anchor_id = NodeId::new(anchor);
        let accept = tokio::spawn(async move {
            SecureSession::accept(server, |_| Some(secret()), &anchor_id, TIMEOUT)
                .await
                .unwrap()
        });
        let member = SecureSession::initiate(client, &secret(), &NodeId::new(member), TIMEOUT)
            .await
            .unwrap();
        (member, accept.await.unwrap())
    }

    async fn run(member: &Arc<Circle>, anchor: &Arc<Circle>, name: &str) -> Result<AnchorReport, MeshError> {
        let (mut member_session, mut anchor_session) = sessions(name, "anchor").await;
        let anchor = anchor.clone();
        let config = SyncConfig::default();
        let serving = tokio::spawn(async move {
            let first = anchor_session.recv().await.unwrap();
            serve(&mut anchor_session, &anchor, first, &config).await
        });
        let report = exchange(&mut member_session, member, &config).await;
        drop(member_session);
        serving.await.unwrap().unwrap();
        report
    }

    // ===========================================
    // Store and forward
    // ===========================================

    #[tokio::test]
    async fn offline_members_meet_through_anchor() {
        let anchor = circle("anchor", true);
        let alice = circle("alice", false);
        let bob = circle("bob", false);

        let msg = alice.post(&ChannelId::general(), "left for bob").await.unwrap();
        let first = run(&alice, &anchor, "alice").await.unwrap();
        assert_eq!(first.pushed, 1);
        assert_eq!(first.accepted, 1);

        let second = run(&bob, &anchor, "bob").await.unwrap();
        assert_eq!(second.pulled.received, 1);
        let received = bob.message(&msg.msg_id).await.unwrap();
        assert_eq!(received.text.as_deref(), Some("left for bob"));
    }

    #[tokio::test]
    async fn repeated_exchange_is_incremental() {
        let anchor = circle("anchor", true);
        let alice = circle("alice", false);
        alice.post(&ChannelId::general(), "one").await.unwrap();

        run(&alice, &anchor, "alice").await.unwrap();
        let again = run(&alice, &anchor, "alice").await.unwrap();
        assert_eq!(again.pushed, 0);
        assert_eq!(again.pulled.received, 0);
        assert_eq!(again.pulled.duplicate, 0);
    }

    #[tokio::test]
    async fn pull_pages_until_drained() {
        let anchor = circle("anchor", true);
        for i in 0..(PULL_LIMIT + 20) {
            anchor.post(&ChannelId::general(), &format!("m{i}")).await.unwrap();
        }
        let bob = circle("bob", false);
        let report = run(&bob, &anchor, "bob").await.unwrap();
        assert_eq!(report.pulled.received, (PULL_LIMIT + 20) as usize);
    }

    #[tokio::test]
    async fn restarted_anchor_is_pulled_from_the_start() {
        let anchor = circle("anchor", true);
        let carol = circle("carol", false);
        let bob = circle("bob", false);
        for i in 0..10 {
            carol.post(&ChannelId::general(), &format!("before {i}")).await.unwrap();
        }
        run(&carol, &anchor, "carol").await.unwrap();
        let first = run(&bob, &anchor, "bob").await.unwrap();
        assert_eq!(first.pulled.received, 10);

        // Same node id, empty store, new epoch; its cursors restart at 1.
        let restarted = circle("anchor", true);
        assert_ne!(restarted.anchor_epoch(), anchor.anchor_epoch());
        for i in 0..15 {
            carol.post(&ChannelId::general(), &format!("after {i}")).await.unwrap();
        }
        run(&carol, &restarted, "carol").await.unwrap();
        assert_eq!(restarted.anchor_pull(Cursor::zero(), 0).await.messages.len(), 15);

        let second = run(&bob, &restarted, "bob").await.unwrap();
        assert_eq!(second.pulled.received, 15);
        assert_eq!(bob.message_count().await, 25);
    }

    #[tokio::test]
    async fn endless_push_is_cut_off() {
        let anchor = circle("anchor", true);
        let member = circle("member", false);
        member.post(&ChannelId::general(), "x").await.unwrap();
        let key = MarkKey::Anchor(NodeId::new("anchor"));
        let (batch, _) = member.pending_push(&key, now_ms(), 1).await;

        let (mut member_session, mut anchor_session) = sessions("member", "anchor").await;
        let serving = {
            let anchor = anchor.clone();
            tokio::spawn(async move {
                let first = anchor_session.recv().await.unwrap();
                serve(&mut anchor_session, &anchor, first, &SyncConfig::default()).await
            })
        };
        let chunk = Frame::AnchorPush {
            messages: batch,
            more: true,
        };
        for _ in 0..=MAX_PUSH_RECORDS {
            member_session.send(&chunk).await.unwrap();
        }
        assert!(matches!(member_session.recv().await, Ok(Frame::Bye { .. })));
        assert!(matches!(serving.await.unwrap(), Err(MeshError::Protocol(_))));
        assert_eq!(anchor.anchor_pull(Cursor::zero(), 0).await.messages.len(), 1);
    }

    #[tokio::test]
    async fn non_anchor_declines() {
        let not_anchor = circle("anchor", false);
        let alice = circle("alice", false);
        alice.post(&ChannelId::general(), "x").await.unwrap();
        let result = run(&alice, &not_anchor, "alice").await;
        assert!(matches!(result, Err(MeshError::Protocol(_))));
    }
}
