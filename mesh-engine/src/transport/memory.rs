//! In-process network for tests and multi-node simulation.
//!
//! Listeners register under a name; dialing `Endpoint::memory(name, _)`
//! creates a connected pair of channel-backed connections. Names can be
//! marked unreachable to simulate partitions, and a tap records every frame
//! sent over any connection of the network.

use super::{check_frame_size, Connection, Listener, Transport, TransportError};
use async_trait::async_trait;
use mesh_types::Endpoint;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

type Tap = Arc<Mutex<Vec<Vec<u8>>>>;

#[derive(Debug, Default)]
struct NetworkInner {
    listeners: HashMap<String, mpsc::UnboundedSender<MemoryConnection>>,
    unreachable: HashSet<String>,
    tap: Option<Tap>,
}

/// Shared in-memory network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener under `name`.
    pub fn bind(&self, name: &str) -> Result<MemoryListener, TransportError> {
        let mut inner = self.lock();
        if inner
            .listeners
            .get(name)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(TransportError::BindFailed(format!("{name} already bound")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.listeners.insert(name.to_string(), tx);
        Ok(MemoryListener {
            name: name.to_string(),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Make dials to `name` fail (or succeed again).
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut inner = self.lock();
        if unreachable {
            inner.unreachable.insert(name.to_string());
        } else {
            inner.unreachable.remove(name);
        }
    }

    /// Start recording every frame sent on connections created from now on.
    pub fn start_capture(&self) {
        self.lock().tap = Some(Arc::new(Mutex::new(Vec::new())));
    }

    /// Frames recorded since [`start_capture`](Self::start_capture).
    pub fn captured(&self) -> Vec<Vec<u8>> {
        match &self.lock().tap {
            Some(tap) => tap.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let name = endpoint.host.clone();
        let inner = self.lock();
        if inner.unreachable.contains(&name) {
            return Err(TransportError::ConnectionFailed(format!("{name} unreachable")));
        }
        let listener = inner
            .listeners
            .get(&name)
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener at {name}")))?;

        let (client, server) = MemoryConnection::pair(&name, inner.tap.clone());
        listener
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed(format!("{name} stopped listening")))?;
        Ok(Box::new(client))
    }
}

/// Accepting side of a registered name.
#[derive(Debug)]
pub struct MemoryListener {
    name: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        Endpoint::memory(self.name.clone(), mesh_types::now_ms())
    }
}

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    peer: String,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    tap: Option<Tap>,
}

impl MemoryConnection {
    fn pair(server_name: &str, tap: Option<Tap>) -> (Self, Self) {
        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let client = Self {
            peer: server_name.to_string(),
            outgoing: Mutex::new(Some(to_server)),
            incoming: tokio::sync::Mutex::new(client_rx),
            tap: tap.clone(),
        };
        let server = Self {
            peer: format!("{server_name}-inbound"),
            outgoing: Mutex::new(Some(to_client)),
            incoming: tokio::sync::Mutex::new(server_rx),
            tap,
        };
        (client, server)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        check_frame_size(data.len())?;
        let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let tx = outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(data.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)?;
        if let Some(tap) = &self.tap {
            tap.lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(data.to_vec());
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn peer_address(&self) -> String {
        self.peer.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        Ok(())
    }
}
