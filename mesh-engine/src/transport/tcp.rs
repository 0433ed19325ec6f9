//! TCP transport using tokio.
//!
//! Frames are written as a 4-byte big-endian length followed by the frame
//! bytes. Reads reject any length above [`MAX_FRAME_SIZE`] before allocating.

use super::{check_frame_size, Connection, Listener, Transport, TransportError};
use async_trait::async_trait;
use mesh_types::{Endpoint, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), TransportError> {
    check_frame_size(data.len())?;

    // Length-prefixed framing (4 bytes, big-endian)
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| TransportError::SendFailed(format!("failed to write length: {e}")))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| TransportError::SendFailed(format!("failed to write data: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(format!("failed to flush: {e}")))?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::ConnectionClosed
        } else {
            TransportError::ReceiveFailed(format!("failed to read length: {e}"))
        }
    })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| TransportError::ReceiveFailed(format!("failed to read data: {e}")))?;
    Ok(data)
}

/// Dials TCP endpoints.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport with the default dial timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the dial timeout.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let address = endpoint.address();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(TcpConnection::new(stream, address)))
    }
}

/// An established TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    peer: String,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpConnection {
    fn new(stream: TcpStream, peer: String) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(writer, data).await
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    fn peer_address(&self) -> String {
        self.peer.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Signal end of stream
            writer.shutdown().await.ok();
        }
        Ok(())
    }
}

/// Accepts TCP connections.
#[derive(Debug)]
pub struct TcpMeshListener {
    listener: TcpListener,
    advertised: Endpoint,
}

impl TcpMeshListener {
    /// Bind to `addr` (e.g. `0.0.0.0:7420`).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let local: SocketAddr = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let advertised = Endpoint::tcp(local.ip().to_string(), local.port(), mesh_types::now_ms());
        Ok(Self {
            listener,
            advertised,
        })
    }

    /// Advertise a different host than the bound address (e.g. behind NAT).
    pub fn with_advertised_host(mut self, host: &str) -> Self {
        self.advertised = Endpoint::tcp(host, self.advertised.port, mesh_types::now_ms());
        self
    }
}

#[async_trait]
impl Listener for TcpMeshListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("accept failed: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(TcpConnection::new(stream, peer.to_string())))
    }

    fn local_endpoint(&self) -> Endpoint {
        let mut endpoint = self.advertised.clone();
        endpoint.observed_ts = mesh_types::now_ms();
        endpoint
    }
}
