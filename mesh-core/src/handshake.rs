//! Session handshake state machine.
//!
//! Pure, side-effect-free state machine for the HELLO / CHALLENGE /
//! HELLO_AUTH / WELCOME exchange. It takes events and produces a new state
//! plus a list of actions. The session layer in `mesh-engine` performs the
//! actual frame I/O and crypto, then feeds the results back in as events.
//!
//! Initiator: `Idle → HelloSent → Challenged → Authenticated → Syncing → Closed|Failed`
//!
//! Responder: `Idle → Challenged → Authenticated → Syncing → Closed|Failed`

/// Which side of the session this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out and sends HELLO.
    Initiator,
    /// Accepted the connection and issues the challenge.
    Responder,
}

/// Why a handshake failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// HELLO named a circle this node does not belong to.
    UnknownCircle,
    /// Token did not verify.
    AuthFailed,
    /// Peer did not confirm encryption.
    EncryptionRefused,
    /// Frame arrived out of order or did not parse.
    ProtocolViolation,
    /// Per-frame deadline expired.
    Timeout,
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing exchanged yet.
    Idle,
    /// Initiator sent HELLO.
    HelloSent,
    /// Challenge issued (responder) or received and answered (initiator).
    Challenged,
    /// Session key derived; frames are sealed from here on.
    Authenticated,
    /// Gossip or anchor exchange in progress.
    Syncing,
    /// Ended normally.
    Closed,
    /// Ended with an error.
    Failed(FailReason),
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Initiator begins.
    Start,
    /// Responder read HELLO.
    HelloReceived {
        /// The named circle is one this node holds.
        circle_known: bool,
    },
    /// Initiator read CHALLENGE.
    ChallengeReceived,
    /// Responder read HELLO_AUTH and checked the token.
    AuthReceived {
        /// Token verified.
        valid: bool,
    },
    /// Initiator read WELCOME.
    WelcomeReceived {
        /// Responder confirmed sealed frames.
        enc_ready: bool,
    },
    /// Round started over the authenticated session.
    BeginSync,
    /// Round finished (BYE sent or received).
    Finished,
    /// A frame arrived that does not fit the current state.
    UnexpectedFrame,
    /// The per-frame deadline expired.
    Timeout,
}

/// Instructions for the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send HELLO with a fresh client nonce.
    SendHello,
    /// Send CHALLENGE with a fresh server nonce.
    SendChallenge,
    /// Send HELLO_AUTH with the token.
    SendHelloAuth,
    /// Derive the session key from both nonces.
    DeriveSessionKey,
    /// Send WELCOME.
    SendWelcome,
    /// Tear down the connection. `silent` means no further frame is sent.
    Close {
        /// Close without sending anything.
        silent: bool,
    },
}

/// Handshake for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    role: Role,
    state: HandshakeState,
}

impl Handshake {
    /// Create a handshake in the `Idle` state.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
        }
    }

    /// Process an event and return the new handshake plus actions to execute.
    ///
    /// Any event that does not fit the current state fails the handshake.
    /// Terminal states absorb every event.
    pub fn on_event(self, event: HandshakeEvent) -> (Self, Vec<HandshakeAction>) {
        use HandshakeAction as A;
        use HandshakeEvent as E;
        use HandshakeState as S;

        let role = self.role;
        let to = |state| Self { role, state };

        match (role, self.state, event) {
            // Terminal states stay put
            (_, S::Closed, _) | (_, S::Failed(_), _) => (self, vec![]),

            // Initiator
            (Role::Initiator, S::Idle, E::Start) => (to(S::HelloSent), vec![A::SendHello]),
            (Role::Initiator, S::HelloSent, E::ChallengeReceived) => {
                (to(S::Challenged), vec![A::SendHelloAuth])
            }
            (Role::Initiator, S::Challenged, E::WelcomeReceived { enc_ready: true }) => {
                (to(S::Authenticated), vec![A::DeriveSessionKey])
            }
            (Role::Initiator, S::Challenged, E::WelcomeReceived { enc_ready: false }) => (
                to(S::Failed(FailReason::EncryptionRefused)),
                vec![A::Close { silent: true }],
            ),

            // Responder
            (Role::Responder, S::Idle, E::HelloReceived { circle_known: true }) => {
                (to(S::Challenged), vec![A::SendChallenge])
            }
            (Role::Responder, S::Idle, E::HelloReceived { circle_known: false }) => (
                to(S::Failed(FailReason::UnknownCircle)),
                vec![A::Close { silent: true }],
            ),
            (Role::Responder, S::Challenged, E::AuthReceived { valid: true }) => (
                to(S::Authenticated),
                vec![A::DeriveSessionKey, A::SendWelcome],
            ),
            (Role::Responder, S::Challenged, E::AuthReceived { valid: false }) => (
                to(S::Failed(FailReason::AuthFailed)),
                vec![A::Close { silent: true }],
            ),

            // Both roles
            (_, S::Authenticated, E::BeginSync) => (to(S::Syncing), vec![]),
            (_, S::Authenticated, E::Finished) | (_, S::Syncing, E::Finished) => {
                (to(S::Closed), vec![A::Close { silent: false }])
            }
            (_, _, E::Timeout) => (
                to(S::Failed(FailReason::Timeout)),
                vec![A::Close { silent: true }],
            ),

            // Anything else is out of order
            _ => (
                to(S::Failed(FailReason::ProtocolViolation)),
                vec![A::Close { silent: true }],
            ),
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Role of this side.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Frames are sealed in this state.
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::Authenticated | HandshakeState::Syncing
        )
    }

    /// Check if the handshake ended, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, HandshakeState::Closed | HandshakeState::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // Initiator path
    // ===========================================

    #[test]
    fn initiator_happy_path() {
        let hs = Handshake::new(Role::Initiator);
        let (hs, actions) = hs.on_event(HandshakeEvent::Start);
        assert_eq!(hs.state(), HandshakeState::HelloSent);
        assert_eq!(actions, vec![HandshakeAction::SendHello]);

        let (hs, actions) = hs.on_event(HandshakeEvent::ChallengeReceived);
        assert_eq!(hs.state(), HandshakeState::Challenged);
        assert_eq!(actions, vec![HandshakeAction::SendHelloAuth]);

        let (hs, actions) = hs.on_event(HandshakeEvent::WelcomeReceived { enc_ready: true });
        assert!(hs.is_authenticated());
        assert_eq!(actions, vec![HandshakeAction::DeriveSessionKey]);

        let (hs, _) = hs.on_event(HandshakeEvent::BeginSync);
        assert_eq!(hs.state(), HandshakeState::Syncing);

        let (hs, actions) = hs.on_event(HandshakeEvent::Finished);
        assert_eq!(hs.state(), HandshakeState::Closed);
        assert_eq!(actions, vec![HandshakeAction::Close { silent: false }]);
    }

    #[test]
    fn initiator_rejects_welcome_before_challenge() {
        let (hs, _) = Handshake::new(Role::Initiator).on_event(HandshakeEvent::Start);
        let (hs, actions) = hs.on_event(HandshakeEvent::WelcomeReceived { enc_ready: true });
        assert_eq!(
            hs.state(),
            HandshakeState::Failed(FailReason::ProtocolViolation)
        );
        assert_eq!(actions, vec![HandshakeAction::Close { silent: true }]);
    }

    #[test]
    fn initiator_fails_without_encryption() {
        let (hs, _) = Handshake::new(Role::Initiator).on_event(HandshakeEvent::Start);
        let (hs, _) = hs.on_event(HandshakeEvent::ChallengeReceived);
        let (hs, _) = hs.on_event(HandshakeEvent::WelcomeReceived { enc_ready: false });
        assert_eq!(
            hs.state(),
            HandshakeState::Failed(FailReason::EncryptionRefused)
        );
    }

    // ===========================================
    // Responder path
    // ===========================================

    #[test]
    fn responder_happy_path() {
        let hs = Handshake::new(Role::Responder);
        let (hs, actions) = hs.on_event(HandshakeEvent::HelloReceived { circle_known: true });
        assert_eq!(hs.state(), HandshakeState::Challenged);
        assert_eq!(actions, vec![HandshakeAction::SendChallenge]);

        let (hs, actions) = hs.on_event(HandshakeEvent::AuthReceived { valid: true });
        assert_eq!(hs.state(), HandshakeState::Authenticated);
        assert_eq!(
            actions,
            vec![HandshakeAction::DeriveSessionKey, HandshakeAction::SendWelcome]
        );
    }

    #[test]
    fn responder_unknown_circle_closes_silently() {
        let (hs, actions) = Handshake::new(Role::Responder)
            .on_event(HandshakeEvent::HelloReceived { circle_known: false });
        assert_eq!(hs.state(), HandshakeState::Failed(FailReason::UnknownCircle));
        assert_eq!(actions, vec![HandshakeAction::Close { silent: true }]);
    }

    #[test]
    fn responder_bad_token_sends_nothing() {
        let (hs, _) = Handshake::new(Role::Responder)
            .on_event(HandshakeEvent::HelloReceived { circle_known: true });
        let (hs, actions) = hs.on_event(HandshakeEvent::AuthReceived { valid: false });
        assert_eq!(hs.state(), HandshakeState::Failed(FailReason::AuthFailed));
        assert!(!actions.contains(&HandshakeAction::SendWelcome));
        assert_eq!(actions, vec![HandshakeAction::Close { silent: true }]);
    }

    #[test]
    fn responder_cannot_start() {
        let (hs, _) = Handshake::new(Role::Responder).on_event(HandshakeEvent::Start);
        assert_eq!(
            hs.state(),
            HandshakeState::Failed(FailReason::ProtocolViolation)
        );
    }

    // ===========================================
    // Shared behaviour
    // ===========================================

    #[test]
    fn timeout_fails_from_any_live_state() {
        let (hs, _) = Handshake::new(Role::Initiator).on_event(HandshakeEvent::Start);
        let (hs, _) = hs.on_event(HandshakeEvent::Timeout);
        assert_eq!(hs.state(), HandshakeState::Failed(FailReason::Timeout));
    }

    #[test]
    fn terminal_states_absorb_events() {
        let (hs, _) = Handshake::new(Role::Responder)
            .on_event(HandshakeEvent::HelloReceived { circle_known: false });
        let (after, actions) = hs.on_event(HandshakeEvent::AuthReceived { valid: true });
        assert_eq!(after, hs);
        assert!(actions.is_empty());
        assert!(after.is_terminal());
    }
}
