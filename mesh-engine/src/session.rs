//! Authenticated, sealed sessions over a transport connection.
//!
//! [`SecureSession`] executes the actions produced by the pure
//! [`Handshake`] state machine from `mesh-core`:
//!
//! ```text
//! Initiator                         Responder
//!   HELLO{version,node,circle,cn} →
//!                                 ← CHALLENGE{sn}
//!   HELLO_AUTH{token}             →
//!                                 ← WELCOME{enc_ready,node}
//!   ...sealed frames in both directions...
//! ```
//!
//! A responder that does not know the circle, or receives a bad token,
//! closes without sending anything further. Every read has a deadline.

use std::time::Duration;

use mesh_core::{
    FailReason, Handshake, HandshakeAction, HandshakeEvent, HandshakeState, Role,
};
use mesh_types::{CircleId, Frame, NodeId, WireError, MAX_PLAIN_FRAME, PROTOCOL_VERSION};
use tracing::{debug, warn};

use crate::crypto::{
    derive_session_key, handshake_token, open_frame, random_bytes, seal_frame,
    verify_handshake_token, CircleSecret, Direction, SessionKey, HANDSHAKE_NONCE_SIZE,
};
use crate::transport::Connection;
use crate::MeshError;

/// Default per-frame read deadline (12 s).
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(12);

/// An authenticated session with one peer for one circle.
pub struct SecureSession {
    conn: Box<dyn Connection>,
    handshake: Handshake,
    key: SessionKey,
    circle_id: CircleId,
    peer: NodeId,
    frame_timeout: Duration,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("role", &self.handshake.role())
            .field("state", &self.handshake.state())
            .field("circle_id", &self.circle_id)
            .field("peer", &self.peer)
            .field("key", &self.key)
            .finish()
    }
}

async fn read_raw(
    conn: &dyn Connection,
    frame_timeout: Duration,
) -> Result<Vec<u8>, MeshError> {
    match tokio::time::timeout(frame_timeout, conn.recv()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(MeshError::Timeout("frame read")),
    }
}

async fn send_plain(conn: &dyn Connection, frame: &Frame) -> Result<(), MeshError> {
    conn.send(&frame.to_bytes()?).await?;
    Ok(())
}

/// Feed a failure event, run the resulting close, and turn the state into an error.
async fn abort(conn: &dyn Connection, handshake: Handshake, event: HandshakeEvent) -> MeshError {
    let (handshake, actions) = handshake.on_event(event);
    for action in actions {
        if let HandshakeAction::Close { .. } = action {
            conn.close().await.ok();
        }
    }
    match handshake.state() {
        HandshakeState::Failed(reason) => MeshError::Handshake(reason),
        _ => MeshError::Handshake(FailReason::ProtocolViolation),
    }
}

/// Read a handshake frame, mapping deadline and parse failures to events.
async fn read_handshake_frame(
    conn: &dyn Connection,
    handshake: Handshake,
    frame_timeout: Duration,
) -> Result<Frame, MeshError> {
    let bytes = match read_raw(conn, frame_timeout).await {
        Ok(bytes) => bytes,
        Err(MeshError::Timeout(_)) => {
            return Err(abort(conn, handshake, HandshakeEvent::Timeout).await)
        }
        Err(e) => {
            conn.close().await.ok();
            return Err(e);
        }
    };
    match Frame::from_bytes(&bytes) {
        Ok(frame) => Ok(frame),
        Err(_) => Err(abort(conn, handshake, HandshakeEvent::UnexpectedFrame).await),
    }
}

fn decode_nonce(hex_str: &str) -> Option<Vec<u8>> {
    hex::decode(hex_str)
        .ok()
        .filter(|n| n.len() == HANDSHAKE_NONCE_SIZE)
}

impl SecureSession {
    /// Run the initiator side over a freshly dialed connection.
    pub async fn initiate(
        conn: Box<dyn Connection>,
        secret: &CircleSecret,
        local: &NodeId,
        frame_timeout: Duration,
    ) -> Result<Self, MeshError> {
        let circle_id = secret.circle_id();
        let client_nonce: [u8; HANDSHAKE_NONCE_SIZE] = random_bytes()?;

        let (handshake, actions) = Handshake::new(Role::Initiator).on_event(HandshakeEvent::Start);
        for action in actions {
            if action == HandshakeAction::SendHello {
                let hello = Frame::Hello {
                    version: PROTOCOL_VERSION,
                    node_id: local.clone(),
                    circle_id: circle_id.clone(),
                    client_nonce: hex::encode(client_nonce),
                };
                if let Err(e) = send_plain(conn.as_ref(), &hello).await {
                    conn.close().await.ok();
                    return Err(e);
                }
            }
        }

        let server_nonce = match read_handshake_frame(conn.as_ref(), handshake, frame_timeout).await? {
            Frame::Challenge { server_nonce } => match decode_nonce(&server_nonce) {
                Some(nonce) => nonce,
                None => {
                    return Err(
                        abort(conn.as_ref(), handshake, HandshakeEvent::UnexpectedFrame).await,
                    )
                }
            },
            other => {
                debug!(frame = other.name(), "expected CHALLENGE");
                return Err(abort(conn.as_ref(), handshake, HandshakeEvent::UnexpectedFrame).await);
            }
        };

        let (handshake, actions) = handshake.on_event(HandshakeEvent::ChallengeReceived);
        for action in actions {
            if action == HandshakeAction::SendHelloAuth {
                let token = handshake_token(secret, local, &circle_id, &server_nonce)?;
                send_plain(conn.as_ref(), &Frame::HelloAuth { token }).await?;
            }
        }

        let (enc_ready, peer) = match read_handshake_frame(conn.as_ref(), handshake, frame_timeout).await? {
            Frame::Welcome { enc_ready, node_id } => (enc_ready, node_id),
            other => {
                debug!(frame = other.name(), "expected WELCOME");
                return Err(abort(conn.as_ref(), handshake, HandshakeEvent::UnexpectedFrame).await);
            }
        };

        let event = HandshakeEvent::WelcomeReceived { enc_ready };
        if !enc_ready {
            return Err(abort(conn.as_ref(), handshake, event).await);
        }
        let (handshake, actions) = handshake.on_event(event);
        let mut key = None;
        for action in actions {
            if action == HandshakeAction::DeriveSessionKey {
                key = Some(derive_session_key(secret, &client_nonce, &server_nonce)?);
            }
        }
        let key = key.ok_or(MeshError::Handshake(FailReason::ProtocolViolation))?;

        debug!(peer = %peer, circle = %circle_id, "session established (initiator)");
        Ok(Self {
            conn,
            handshake,
            key,
            circle_id,
            peer,
            frame_timeout,
        })
    }

    /// Run the responder side over an accepted connection.
    ///
    /// `resolve` maps a circle id from HELLO to the secret of a circle this
    /// node belongs to.
    pub async fn accept<F>(
        conn: Box<dyn Connection>,
        resolve: F,
        local: &NodeId,
        frame_timeout: Duration,
    ) -> Result<Self, MeshError>
    where
        F: Fn(&CircleId) -> Option<CircleSecret>,
    {
        let handshake = Handshake::new(Role::Responder);

        let (peer, circle_id, client_nonce) =
            match read_handshake_frame(conn.as_ref(), handshake, frame_timeout).await? {
                Frame::Hello {
                    version,
                    node_id,
                    circle_id,
                    client_nonce,
                } if version == PROTOCOL_VERSION => match decode_nonce(&client_nonce) {
                    Some(nonce) => (node_id, circle_id, nonce),
                    None => {
                        return Err(
                            abort(conn.as_ref(), handshake, HandshakeEvent::UnexpectedFrame).await,
                        )
                    }
                },
                other => {
                    debug!(frame = other.name(), "expected HELLO");
                    return Err(
                        abort(conn.as_ref(), handshake, HandshakeEvent::UnexpectedFrame).await,
                    );
                }
            };

        let secret = resolve(&circle_id);
        let event = HandshakeEvent::HelloReceived {
            circle_known: secret.is_some(),
        };
        let Some(secret) = secret else {
            debug!(peer = %peer, "HELLO for unknown circle");
            return Err(abort(conn.as_ref(), handshake, event).await);
        };

        let server_nonce: [u8; HANDSHAKE_NONCE_SIZE] = random_bytes()?;
        let (handshake, actions) = handshake.on_event(event);
        for action in actions {
            if action == HandshakeAction::SendChallenge {
                let challenge = Frame::Challenge {
                    server_nonce: hex::encode(server_nonce),
                };
                send_plain(conn.as_ref(), &challenge).await?;
            }
        }

        let token = match read_handshake_frame(conn.as_ref(), handshake, frame_timeout).await? {
            Frame::HelloAuth { token } => token,
            other => {
                debug!(frame = other.name(), "expected HELLO_AUTH");
                return Err(abort(conn.as_ref(), handshake, HandshakeEvent::UnexpectedFrame).await);
            }
        };

        let valid = verify_handshake_token(&secret, &peer, &circle_id, &server_nonce, &token);
        let event = HandshakeEvent::AuthReceived { valid };
        if !valid {
            warn!(peer = %peer, circle = %circle_id, "handshake token rejected");
            return Err(abort(conn.as_ref(), handshake, event).await);
        }

        let (handshake, actions) = handshake.on_event(event);
        let mut key = None;
        for action in actions {
            match action {
                HandshakeAction::DeriveSessionKey => {
                    key = Some(derive_session_key(&secret, &client_nonce, &server_nonce)?);
                }
                HandshakeAction::SendWelcome => {
                    let welcome = Frame::Welcome {
                        enc_ready: true,
                        node_id: local.clone(),
                    };
                    send_plain(conn.as_ref(), &welcome).await?;
                }
                _ => {}
            }
        }
        let key = key.ok_or(MeshError::Handshake(FailReason::ProtocolViolation))?;

        debug!(peer = %peer, circle = %circle_id, "session established (responder)");
        Ok(Self {
            conn,
            handshake,
            key,
            circle_id,
            peer,
            frame_timeout,
        })
    }

    fn directions(&self) -> (Direction, Direction) {
        match self.handshake.role() {
            Role::Initiator => (
                Direction::InitiatorToResponder,
                Direction::ResponderToInitiator,
            ),
            Role::Responder => (
                Direction::ResponderToInitiator,
                Direction::InitiatorToResponder,
            ),
        }
    }

    fn fail(&mut self, event: HandshakeEvent) {
        let (handshake, _) = self.handshake.on_event(event);
        self.handshake = handshake;
    }

    /// Mark the start of a round.
    pub fn begin_sync(&mut self) {
        if self.handshake.state() == HandshakeState::Authenticated {
            let (handshake, _) = self.handshake.on_event(HandshakeEvent::BeginSync);
            self.handshake = handshake;
        }
    }

    /// Seal and send a frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), MeshError> {
        let bytes = frame.to_bytes()?;
        if bytes.len() > MAX_PLAIN_FRAME {
            return Err(WireError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_PLAIN_FRAME,
            }
            .into());
        }
        let (outbound, _) = self.directions();
        let sealed = seal_frame(&self.key, &self.circle_id, outbound, &bytes)?;
        self.conn.send(&sealed).await?;
        Ok(())
    }

    /// Receive and open the next frame.
    pub async fn recv(&mut self) -> Result<Frame, MeshError> {
        let bytes = match read_raw(self.conn.as_ref(), self.frame_timeout).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if matches!(e, MeshError::Timeout(_)) {
                    self.fail(HandshakeEvent::Timeout);
                }
                return Err(e);
            }
        };
        let (_, inbound) = self.directions();
        let opened = match open_frame(&self.key, &self.circle_id, inbound, &bytes) {
            Ok(opened) => opened,
            Err(e) => {
                self.fail(HandshakeEvent::UnexpectedFrame);
                return Err(e.into());
            }
        };
        match Frame::from_bytes(&opened) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.fail(HandshakeEvent::UnexpectedFrame);
                Err(e.into())
            }
        }
    }

    /// End the session and close the connection.
    pub async fn close(mut self) {
        let (handshake, actions) = self.handshake.on_event(HandshakeEvent::Finished);
        self.handshake = handshake;
        if actions.is_empty() {
            // Already terminal
            self.conn.close().await.ok();
            return;
        }
        for action in actions {
            if let HandshakeAction::Close { .. } = action {
                self.conn.close().await.ok();
            }
        }
    }

    /// The authenticated peer.
    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Circle of this session.
    pub fn circle_id(&self) -> &CircleId {
        &self.circle_id
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.handshake.role()
    }

    /// Handshake state.
    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Remote transport address.
    pub fn peer_address(&self) -> String {
        self.conn.peer_address()
    }
}
