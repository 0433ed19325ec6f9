//! Scripted connection for handshake and session unit tests.
//!
//! Queue the frames the remote side should "send", run the code under test,
//! then inspect what it sent. Clones share state, so the handle kept by the
//! test sees everything the code under test did with its clone.

use super::{check_frame_size, Connection, Transport, TransportError};
use async_trait::async_trait;
use mesh_types::{Endpoint, Frame};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Scripted transport and connection.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<Script>>,
}

#[derive(Debug, Default)]
struct Script {
    open: bool,
    peer: Option<String>,
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    refuse_dial: Option<String>,
}

impl MockTransport {
    /// Create an unconnected mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// An open connection from `peer`, as a listener would hand it over.
    pub fn connected(peer: &str) -> Self {
        let mock = Self::new();
        {
            let mut script = mock.lock();
            script.open = true;
            script.peer = Some(peer.to_string());
        }
        mock
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raw bytes the next `recv()` returns.
    pub fn queue_response(&self, data: Vec<u8>) {
        self.lock().inbound.push_back(data);
    }

    /// Queue an unsealed frame, as sent during the handshake.
    pub fn queue_frame(&self, frame: &Frame) -> Result<(), mesh_types::WireError> {
        self.queue_response(frame.to_bytes()?);
        Ok(())
    }

    /// Everything sent so far.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// The most recent send.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.lock().sent.last().cloned()
    }

    /// Whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.lock().open
    }

    /// Make the next dial fail.
    pub fn refuse_next_dial(&self, reason: &str) {
        self.lock().refuse_dial = Some(reason.to_string());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        {
            let mut script = self.lock();
            if let Some(reason) = script.refuse_dial.take() {
                return Err(TransportError::ConnectionFailed(reason));
            }
            script.open = true;
            script.peer = Some(endpoint.address());
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl Connection for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut script = self.lock();
        if !script.open {
            return Err(TransportError::NotConnected);
        }
        check_frame_size(data.len())?;
        script.sent.push(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut script = self.lock();
        if !script.open {
            return Err(TransportError::NotConnected);
        }
        // Running out of script looks like the peer hanging up.
        script.inbound.pop_front().ok_or(TransportError::ConnectionClosed)
    }

    fn peer_address(&self) -> String {
        self.lock().peer.clone().unwrap_or_else(|| "mock".to_string())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().open = false;
        Ok(())
    }
}
