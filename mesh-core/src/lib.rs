//! # mesh-core
//!
//! Pure logic for the circle mesh (no I/O, instant tests).
//!
//! This crate implements the state machines and data structures behind
//! gossip synchronization without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is always passed in as `now_ms`. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about convergence
//!
//! The actual I/O (network, disk, clocks) is performed by `mesh-engine`,
//! which interprets the actions and decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod anchor;
pub mod anchor_store;
pub mod backoff;
pub mod circle;
pub mod directory;
pub mod handshake;
pub mod replay;
pub mod snapshot;
pub mod store;

pub use anchor::{
    compare_candidates, rank_anchor_candidates, AnchorCandidate, AnchorDecision, AnchorElector,
    AnchorPolicy,
};
pub use anchor_store::{AnchorStore, AnchorStoreError, AnchorStorePolicy, PullPage, StoreOutcome};
pub use backoff::Backoff;
pub use circle::{ChannelInfo, CircleView, ControlEffect};
pub use directory::{MergeOutcome, PeerDirectory, DEFAULT_PEER_TTL_MS};
pub use handshake::{
    FailReason, Handshake, HandshakeAction, HandshakeEvent, HandshakeState, Role,
};
pub use replay::{ReplayError, ReplayGuard, RequestStamp};
pub use snapshot::{CircleSnapshot, SnapshotError};
pub use store::{InsertOutcome, MessageStore, RetentionPolicy};
