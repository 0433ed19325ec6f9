//! Transport abstraction for the circle mesh.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (TCP, in-memory network, mock for testing).
//!
//! # Design
//!
//! Transports are connection-oriented and move whole frames:
//! - [`Transport::connect`] dials an [`Endpoint`] and yields a [`Connection`]
//! - [`Listener::accept`] yields inbound connections
//! - [`Connection::send`] / [`Connection::recv`] carry one frame each
//!
//! Frames never exceed [`MAX_FRAME_SIZE`]; the TCP transport adds the 4-byte
//! big-endian length prefix on the wire.
//!
//! # Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let listener = network.bind("bob")?;
//! let conn = network.connect(&Endpoint::memory("bob", 0)).await?;
//! conn.send(&frame_bytes).await?;
//! ```

mod memory;
mod mock;
mod tcp;

pub use memory::{MemoryConnection, MemoryListener, MemoryNetwork};
pub use mock::MockTransport;
pub use tcp::{read_frame, write_frame, TcpConnection, TcpMeshListener, TcpTransport};

use async_trait::async_trait;
use mesh_types::{Endpoint, MAX_FRAME_SIZE};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame exceeds the size limit.
    #[error("frame too large: {size} > {max}")]
    FrameTooLarge {
        /// Frame size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Could not bind a listener.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Reject frames over [`MAX_FRAME_SIZE`].
pub(crate) fn check_frame_size(len: usize) -> Result<(), TransportError> {
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// One established, bidirectional frame stream.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame.
    ///
    /// Blocks until a frame is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Remote address, for logs.
    fn peer_address(&self) -> String;

    /// Close the connection. Further sends fail; the peer sees a close.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Dials peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the given endpoint.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError>;
}

/// Accepts inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Endpoint other nodes can dial to reach this listener.
    fn local_endpoint(&self) -> Endpoint;
}
