//! Events published to the presentation layer.

use mesh_types::{CallEvent, ChatMessage, CircleId, NodeId, PeerRecord};

/// Capacity of the node's event channel.
pub const EVENT_CAPACITY: usize = 256;

/// Something the presentation layer may want to show.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A verified message from another node was merged.
    MessageReceived {
        /// Circle
        circle_id: CircleId,
        /// The message with its plaintext cache
        message: ChatMessage,
    },
    /// A previously unknown peer was learned.
    PeerDiscovered {
        /// Circle
        circle_id: CircleId,
        /// The new record
        peer: PeerRecord,
    },
    /// The elected anchor changed.
    AnchorChanged {
        /// Circle
        circle_id: CircleId,
        /// New anchor, `None` when cleared
        anchor: Option<NodeId>,
    },
    /// A call control event, forwarded untouched.
    CallSignal {
        /// Circle
        circle_id: CircleId,
        /// Author of the event
        from: NodeId,
        /// The event
        call: CallEvent,
    },
}
